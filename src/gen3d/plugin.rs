//! Bevy wiring: queue draining, worker event log and the default scene.

use std::sync::mpsc::Receiver;

use bevy::prelude::*;
use tracing::debug;

use super::{GenObject, GenObjectKind};
use crate::cli::render::EventPrinter;
use crate::client::WorkerEvent;
use crate::dispatch::HostQueue;

/// Non-send resource holding the host end of the dispatch bridge.
pub struct HostQueueRes(pub HostQueue<World>);

/// Non-send resource holding worker events to print.
pub struct WorkerEventsRes {
    events: Receiver<WorkerEvent>,
    printer: EventPrinter,
}

/// Initialize the Gen world: dispatch queue, event log, default scene.
pub fn setup_gen_app(app: &mut App, queue: HostQueue<World>, events: Receiver<WorkerEvent>) {
    app.insert_non_send_resource(HostQueueRes(queue))
        .insert_non_send_resource(WorkerEventsRes {
            events,
            printer: EventPrinter::new(false),
        })
        .add_systems(Startup, setup_default_scene)
        .add_systems(Update, (drain_host_queue, print_worker_events));
}

/// Run every queued job against the world. The queue is taken out of the
/// world while it runs so jobs get `&mut World`.
pub fn drain_host_queue(world: &mut World) {
    let Some(queue) = world.remove_non_send_resource::<HostQueueRes>() else {
        return;
    };
    let executed = queue.0.drain(world);
    if executed > 0 {
        debug!("Drained {} host jobs", executed);
    }
    world.insert_non_send_resource(queue);
}

fn print_worker_events(mut log: NonSendMut<WorkerEventsRes>) {
    let log = &mut *log;
    while let Ok(event) = log.events.try_recv() {
        log.printer.print(&event);
    }
}

/// Default scene: ground plane, camera, directional light.
fn setup_default_scene(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    commands.spawn((
        Mesh3d(meshes.add(Plane3d::new(Vec3::Y, Vec2::new(10.0, 10.0)))),
        MeshMaterial3d(materials.add(StandardMaterial {
            base_color: Color::srgba(0.3, 0.3, 0.3, 1.0),
            perceptual_roughness: 0.8,
            ..default()
        })),
        Transform::from_translation(Vec3::ZERO),
        Name::new("ground_plane"),
        GenObject {
            kind: GenObjectKind::Primitive(super::tools::PrimitiveShape::Plane),
        },
    ));

    commands.spawn((
        Camera3d::default(),
        Transform::from_translation(Vec3::new(5.0, 5.0, 5.0)).looking_at(Vec3::ZERO, Vec3::Y),
        Name::new("main_camera"),
        GenObject {
            kind: GenObjectKind::Camera,
        },
    ));

    commands.spawn((
        DirectionalLight {
            illuminance: 10000.0,
            shadows_enabled: true,
            ..default()
        },
        Transform::from_translation(Vec3::new(4.0, 8.0, 4.0)).looking_at(Vec3::ZERO, Vec3::Y),
        Name::new("main_light"),
        GenObject {
            kind: GenObjectKind::Light,
        },
    ));
}
