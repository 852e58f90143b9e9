#![allow(warnings)]
#![allow(dead_code)]

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate lazy_static;

pub mod api;
pub mod rc;
mod tracer;
