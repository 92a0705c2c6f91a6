#![doc = include_str!("../README.md")]

extern crate bitcoin;

pub mod channel;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod session;
pub mod utill;
