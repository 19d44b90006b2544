//! Genesis Gen: the Bevy `World` as the dispatch host.
//!
//! The agent worker runs on its own thread and reaches the world only
//! through the dispatch bridge. Bevy owns the main thread; an exclusive
//! `Update` system drains the queue once per frame.
//!
//! Architecture: agent worker (tokio) ─job→ HostQueue<World> (Bevy main thread) ─reply→ worker

pub mod plugin;
pub mod tools;

use bevy::prelude::*;

/// Marker component attached to every entity the tools may address.
#[derive(Component, Debug, Clone, Copy)]
pub struct GenObject {
    pub kind: GenObjectKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenObjectKind {
    Primitive(tools::PrimitiveShape),
    Light,
    Camera,
}

impl GenObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primitive(shape) => shape.as_str(),
            Self::Light => "light",
            Self::Camera => "camera",
        }
    }
}
