pub mod btrfs;
pub mod cmd;
pub mod fstab;
pub mod mkfs;
pub mod mount;
pub mod swap;
