//! The `scene` tool package over the Bevy `World`.
//!
//! Handlers run inside the exclusive drain system, so they get the whole
//! world and may spawn, despawn and edit components directly.

use anyhow::{Context, Result, bail};
use bevy::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{GenObject, GenObjectKind};
use crate::tools::{HostTool, ToolPackage, parse_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveShape {
    Cuboid,
    Sphere,
    Cylinder,
    Cone,
    Capsule,
    Torus,
    Plane,
}

impl PrimitiveShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuboid => "cuboid",
            Self::Sphere => "sphere",
            Self::Cylinder => "cylinder",
            Self::Cone => "cone",
            Self::Capsule => "capsule",
            Self::Torus => "torus",
            Self::Plane => "plane",
        }
    }

    /// Unit-sized mesh; size comes from the transform's scale.
    fn mesh(&self) -> Mesh {
        match self {
            Self::Cuboid => Cuboid::new(1.0, 1.0, 1.0).into(),
            Self::Sphere => Sphere::new(0.5).mesh().uv(32, 18),
            Self::Cylinder => Cylinder::new(0.5, 1.0).into(),
            Self::Cone => Cone {
                radius: 0.5,
                height: 1.0,
            }
            .into(),
            Self::Capsule => Capsule3d::new(0.25, 0.5).into(),
            Self::Torus => Torus::new(0.25, 0.5).into(),
            Self::Plane => Plane3d::new(Vec3::Y, Vec2::splat(0.5)).into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreatePrimitiveArgs {
    name: String,
    shape: PrimitiveShape,
    #[serde(default)]
    position: [f32; 3],
    #[serde(default)]
    rotation_degrees: [f32; 3],
    #[serde(default = "default_scale")]
    scale: [f32; 3],
    #[serde(default = "default_color")]
    color: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct TransformArgs {
    name: String,
    position: Option<[f32; 3]>,
    rotation_degrees: Option<[f32; 3]>,
    scale: Option<[f32; 3]>,
}

fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn default_color() -> [f32; 4] {
    [0.8, 0.8, 0.8, 1.0]
}

fn euler(degrees: [f32; 3]) -> Quat {
    Quat::from_euler(
        EulerRot::XYZ,
        degrees[0].to_radians(),
        degrees[1].to_radians(),
        degrees[2].to_radians(),
    )
}

fn find_entity(world: &mut World, name: &str) -> Result<Entity> {
    let mut query = world.query_filtered::<(Entity, &Name), With<GenObject>>();
    match query.iter(world).find(|(_, n)| n.as_str() == name) {
        Some((entity, _)) => Ok(entity),
        None => bail!("Object not found: {}", name),
    }
}

pub fn scene_info(world: &mut World) -> Result<Value> {
    let mut query = world.query::<(&Name, &GenObject, &Transform)>();
    let objects: Vec<Value> = query
        .iter(world)
        .map(|(name, object, transform)| {
            json!({
                "name": name.as_str(),
                "type": object.kind.as_str(),
                "position": transform.translation.to_array(),
                "scale": transform.scale.to_array(),
            })
        })
        .collect();
    Ok(json!({"object_count": objects.len(), "objects": objects}))
}

pub fn object_info(world: &mut World, args: Value) -> Result<Value> {
    let args: NameArgs = parse_args(args)?;
    let entity = find_entity(world, &args.name)?;

    let kind = world
        .get::<GenObject>(entity)
        .map(|o| o.kind.as_str())
        .unwrap_or("unknown");
    let transform = world.get::<Transform>(entity).copied().unwrap_or_default();
    let (x, y, z) = transform.rotation.to_euler(EulerRot::XYZ);

    let color = world
        .get::<MeshMaterial3d<StandardMaterial>>(entity)
        .map(|h| h.0.clone())
        .and_then(|handle| {
            let materials = world.get_resource::<Assets<StandardMaterial>>()?;
            let c = materials.get(&handle)?.base_color.to_srgba();
            Some([c.red, c.green, c.blue, c.alpha])
        });

    Ok(json!({
        "name": args.name,
        "type": kind,
        "position": transform.translation.to_array(),
        "rotation_degrees": [x.to_degrees(), y.to_degrees(), z.to_degrees()],
        "scale": transform.scale.to_array(),
        "color": color,
    }))
}

pub fn create_primitive(world: &mut World, args: Value) -> Result<Value> {
    let args: CreatePrimitiveArgs = parse_args(args)?;
    if find_entity(world, &args.name).is_ok() {
        bail!("Object already exists: {}", args.name);
    }

    let mesh = world
        .get_resource_mut::<Assets<Mesh>>()
        .context("mesh assets unavailable")?
        .add(args.shape.mesh());
    let [r, g, b, a] = args.color;
    let material = world
        .get_resource_mut::<Assets<StandardMaterial>>()
        .context("material assets unavailable")?
        .add(StandardMaterial {
            base_color: Color::srgba(r, g, b, a),
            ..default()
        });

    world.spawn((
        Mesh3d(mesh),
        MeshMaterial3d(material),
        Transform {
            translation: Vec3::from_array(args.position),
            rotation: euler(args.rotation_degrees),
            scale: Vec3::from_array(args.scale),
        },
        Name::new(args.name.clone()),
        GenObject {
            kind: GenObjectKind::Primitive(args.shape),
        },
    ));

    Ok(json!({"name": args.name}))
}

pub fn delete_object(world: &mut World, args: Value) -> Result<Value> {
    let args: NameArgs = parse_args(args)?;
    let entity = find_entity(world, &args.name)?;
    world.entity_mut(entity).despawn_recursive();
    Ok(json!({"deleted": args.name}))
}

pub fn set_transform(world: &mut World, args: Value) -> Result<Value> {
    let args: TransformArgs = parse_args(args)?;
    let entity = find_entity(world, &args.name)?;
    let mut transform = world
        .get_mut::<Transform>(entity)
        .with_context(|| format!("{} has no transform", args.name))?;

    if let Some(position) = args.position {
        transform.translation = Vec3::from_array(position);
    }
    if let Some(rotation) = args.rotation_degrees {
        transform.rotation = euler(rotation);
    }
    if let Some(scale) = args.scale {
        transform.scale = Vec3::from_array(scale);
    }

    Ok(json!({
        "name": args.name,
        "position": transform.translation.to_array(),
        "scale": transform.scale.to_array(),
    }))
}

fn vec3_schema(description: &str) -> Value {
    json!({
        "type": "array",
        "items": {"type": "number"},
        "minItems": 3,
        "maxItems": 3,
        "description": description
    })
}

fn name_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"name": {"type": "string", "description": "Object name"}},
        "required": ["name"]
    })
}

pub fn scene_package() -> ToolPackage<World> {
    ToolPackage::new("scene", "Inspect and edit the 3D scene")
        .with_tool(HostTool::new(
            "get_scene_info",
            "List every object in the scene with its type, position and scale",
            json!({"type": "object", "properties": {}}),
            |world: &mut World, _args| scene_info(world),
        ))
        .with_tool(HostTool::new(
            "get_object_info",
            "Get the type, transform and color of one object",
            name_schema(),
            object_info,
        ))
        .with_tool(HostTool::new(
            "create_primitive",
            "Spawn a unit-sized primitive shape. Size it with scale",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Unique object name"},
                    "shape": {
                        "type": "string",
                        "enum": ["cuboid", "sphere", "cylinder", "cone", "capsule", "torus", "plane"]
                    },
                    "position": vec3_schema("Position [x, y, z]"),
                    "rotation_degrees": vec3_schema("Euler rotation in degrees"),
                    "scale": vec3_schema("Scale [x, y, z]"),
                    "color": {
                        "type": "array",
                        "items": {"type": "number"},
                        "minItems": 4,
                        "maxItems": 4,
                        "description": "RGBA in 0..1"
                    }
                },
                "required": ["name", "shape"]
            }),
            create_primitive,
        ))
        .with_tool(HostTool::new(
            "delete_object",
            "Delete an object and its children",
            name_schema(),
            delete_object,
        ))
        .with_tool(HostTool::new(
            "set_object_transform",
            "Set any of position, rotation and scale of an object",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "position": vec3_schema("Position [x, y, z]"),
                    "rotation_degrees": vec3_schema("Euler rotation in degrees"),
                    "scale": vec3_schema("Scale [x, y, z]")
                },
                "required": ["name"]
            }),
            set_transform,
        ))
}
