mod cancel;
pub mod logger;
mod queue;

pub use cancel::Cancel;
pub use crossbeam_channel as channel;
pub use queue::{recv, send};
