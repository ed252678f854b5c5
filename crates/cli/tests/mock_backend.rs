use std::net::SocketAddr;
use std::time::Duration;

use kerbside::mock_backend;
use kerbside_session::events::{JoinChat, OutboundEvent, SendMessage};
use kerbside_session::{
    ConversationId, HistorySource, InboundEvent, ParticipantId, Transport, TransportEvent,
};
use kerbside_transport::{HttpHistorySource, SocketIoTransport, TransportConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn serve() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, mock_backend::router()).await.unwrap() });
    address
}

fn config(address: SocketAddr) -> TransportConfig {
    TransportConfig::new(&format!("http://{address}"))
        .unwrap()
        .with_connect_timeout(Duration::from_secs(5))
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event stream ended")
}

#[tokio::test]
async fn history_of_an_unknown_conversation_is_empty() {
    let address = serve().await;
    let history = HttpHistorySource::new(config(address));

    let entries = history
        .fetch(&ConversationId::parse("nobody here").unwrap())
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn sent_message_is_echoed_and_stored_under_the_decoded_id() {
    let address = serve().await;
    let conversation_id = ConversationId::parse("pickup 7").unwrap();
    let participant_id = ParticipantId::parse("u-1").unwrap();

    let transport = SocketIoTransport::new(config(address));
    let mut handle = transport.open().unwrap();
    tokio::spawn(handle.worker);
    assert_eq!(next_event(&mut handle.events).await, TransportEvent::Connected);

    handle
        .commands
        .emit(OutboundEvent::JoinChat(JoinChat {
            display_name: "Asha".to_string(),
            participant_id: participant_id.clone(),
            conversation_id: conversation_id.clone(),
        }))
        .unwrap();
    handle
        .commands
        .emit(OutboundEvent::SendMessage(SendMessage {
            display_name: "Asha".to_string(),
            participant_id,
            conversation_id: conversation_id.clone(),
            text: "at the north gate".to_string(),
        }))
        .unwrap();

    let echo = loop {
        if let TransportEvent::Inbound(InboundEvent::MessageReceived(message)) =
            next_event(&mut handle.events).await
        {
            break message;
        }
    };
    assert_eq!(echo.sender_id, "u-1");
    assert_eq!(echo.text, "at the north gate");
    assert!(echo.timestamp.is_some());

    // The id goes out as `pickup%207` and must land in the same room.
    let entries = HttpHistorySource::new(config(address))
        .fetch(&conversation_id)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sender_id, "u-1");
    assert_eq!(entries[0].sender_display_name, "Asha");
    assert_eq!(entries[0].text, "at the north gate");
    assert!(entries[0].created_at.is_some());

    handle.commands.close().unwrap();
}
