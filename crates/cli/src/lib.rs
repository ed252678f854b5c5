//! Terminal client pieces: layered settings, snapshot rendering and the local mock backend.

pub mod console;
pub mod interrupt;
pub mod mock_backend;
pub mod settings;
