//! # Remote execution
//!
//! Running code inside the target without a debugger attached.
//!
//! - [`callconv`]: encodes (and decodes) the call stubs
//! - [`exports`]: finds function addresses in images mapped in the target
//! - [`invoker`]: runs a stub on a remote thread and collects the result

pub mod callconv;
pub mod exports;
pub mod invoker;

pub use callconv::{CallArg, CallEncoder, DecodedCall};
pub use exports::RemoteExports;
pub use invoker::RemoteInvoker;
