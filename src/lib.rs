pub mod binder;
pub mod bundle;
pub mod bytes;
pub mod channel;
pub mod error;
pub mod event;
pub mod handle;
pub mod object;
pub mod parcel;
pub mod process;
pub mod provider;
pub mod registry;
pub mod sys;

pub use binder::{Binder, BinderClient, TransactionFlags};
pub use bundle::{Bundle, BundleValue};
pub use channel::{Role, ServiceChannel};
pub use error::{Error, Result};
pub use object::{ObjectCore, ServiceObject};
pub use parcel::{Parcel, Parcelable};
pub use process::{MessageClient, Process};
pub use registry::{ObjectUid, Registry};
