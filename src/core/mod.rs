// Core modules implementing storage, encoding, locking, and error modeling.
pub mod codec;
pub mod crypto;
pub mod error;
pub mod events;
pub mod layout;
pub mod lock;
pub mod options;
pub mod pool;
pub mod reclaim;
pub mod registry;
pub mod segment;
pub mod snapshot;
pub mod store;
pub mod ticker;
