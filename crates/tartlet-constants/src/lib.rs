#![no_std]

pub mod env;
pub mod helper;
pub mod layout;
pub mod shares;
pub mod status;
