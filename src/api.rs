//! Generated containerd protobuf types and services.
#![allow(clippy::all)]

pub mod types {
    tonic::include_proto!("containerd.types");
}

pub mod services {
    pub mod snapshots {
        pub mod v1 {
            tonic::include_proto!("containerd.services.snapshots.v1");
        }
    }
}
