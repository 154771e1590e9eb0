//! Hypervisor backend.
//!
//! Only Linux KVM is supported. The backend wraps the system, VM and VCPU
//! file descriptors in typed handles; higher layers never issue ioctls
//! themselves.

pub mod kvm;

/// Check if the hypervisor is available on this system.
pub fn is_available() -> bool {
    kvm::is_available()
}

/// Get the name of the backend.
pub fn name() -> &'static str {
    "kvm"
}
