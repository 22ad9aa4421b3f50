//! Tools owned by the runtime core

mod dmail;
mod think;

pub use dmail::SendDMailTool;
pub use think::ThinkTool;
