//! The device side: local-first storage, the remote client and the
//! selected-project slot.

pub mod error;
pub mod local;
pub mod manager;
pub mod remote;
pub mod selected;
pub mod settings;

pub use local::{FileStorage, LocalStorage};
pub use manager::{ProjectDataManager, SaveOutcome};
pub use selected::SelectedProjectRegistry;
pub use settings::{RemoteSettings, StorageMode};
