//! Change records and notifications.

mod notify;
mod record;

pub use notify::{vector_delta, ChangeNotification, ChangeObserver};
pub use record::{
    ChangeKey, ChangeRecord, FieldChange, MultiStringChange, ObjectLifecycle, VirtualChange,
};
