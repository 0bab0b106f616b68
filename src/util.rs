use anyhow::anyhow;
use std::any::Any;

/// Convert a payload captured by `catch_unwind` into a readable error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
