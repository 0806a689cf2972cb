mod vrt_lib;

pub use vrt_lib::*;
