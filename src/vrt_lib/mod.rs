//! Virtualizer core: aggregates raw disks from many nodes into
//! fault-tolerant virtual volumes.
pub mod assembly;
pub mod checksum;
pub mod desc;
pub mod error;
pub mod extent;
pub mod group;
pub mod layout;
pub mod nodeset;
pub mod pr;
pub mod rain1;
pub mod rdev;
pub mod rdev_sb;
pub mod sstriping;
pub mod storage;
pub mod stream;
pub mod superblock;
pub mod token;
pub mod uuid;
pub mod volume;

pub use error::{VrtError, VrtResult};
pub use group::{GroupCreateParams, GroupStatus, VrtGroup, VrtRuntime};
pub use layout::LayoutKind;
pub use uuid::ExaUuid;
