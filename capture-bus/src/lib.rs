#![allow(dead_code)]

pub mod annexb;
pub mod depth;
pub mod encoder;
pub mod frame;
pub mod session;
