//! Backend service abstractions and their VPC implementations.

mod traits;
pub mod vpc;

pub use traits::{
    BackendError, BootVolumeAttachment, ComputeApi, FloatingIp, FloatingIpPrototype, IdRef,
    Instance, InstanceAction, InstancePrototype, NameRef, NetworkInterface,
    NetworkInterfacePrototype, SearchApi, SearchDoc, SearchItem, TaggingApi, VolumePrototype,
};
