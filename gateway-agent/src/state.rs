use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Lock-guarded map or value shared between tasks.
pub type Shared<T> = Arc<Mutex<T>>;

/// Read-mostly value; readers clone a snapshot, writers replace it whole.
pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn new_rw_state<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}
