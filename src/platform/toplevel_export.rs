//! Client bindings for `hyprland_toplevel_export_v1`, generated by the build script.

#![allow(dead_code, non_camel_case_types, unused_unsafe, unused_variables)]
#![allow(non_upper_case_globals, non_snake_case, unused_imports)]
#![allow(missing_docs, clippy::all)]

pub(crate) use wayland_client::protocol::{wl_buffer, wl_shm};
pub(crate) use wayland_client::sys;
pub(crate) use wayland_client::{AnonymousObject, Attached, Main, Proxy, ProxyMap};
pub(crate) use wayland_commons::map::{Object, ObjectMetadata};
pub(crate) use wayland_commons::smallvec;
pub(crate) use wayland_commons::wire::{Argument, ArgumentType, Message, MessageDesc};
pub(crate) use wayland_commons::{Interface, MessageGroup};

include!(concat!(env!("OUT_DIR"), "/hyprland_toplevel_export_v1.rs"));
