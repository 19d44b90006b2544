//! In-memory scene and its tool packages.
//!
//! Objects are referenced by name. Every tool handler runs on the host thread
//! with exclusive access to the scene.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::tools::{HostTool, ToolPackage, parse_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Cube,
    Sphere,
    Cylinder,
    Cone,
    Torus,
    Plane,
    Light,
    Camera,
    Empty,
}

impl ObjectKind {
    /// Base name for new objects of this kind.
    fn base_name(&self) -> &'static str {
        match self {
            Self::Cube => "Cube",
            Self::Sphere => "Sphere",
            Self::Cylinder => "Cylinder",
            Self::Cone => "Cone",
            Self::Torus => "Torus",
            Self::Plane => "Plane",
            Self::Light => "Light",
            Self::Camera => "Camera",
            Self::Empty => "Empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneObject {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub location: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: [f64; 3],
    pub color: [f64; 4],
}

#[derive(Debug, Clone, Default)]
pub struct MemoryScene {
    name: String,
    objects: Vec<SceneObject>,
    selected: Vec<String>,
    active: Option<String>,
}

impl MemoryScene {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A scene with a camera, a light and a selected, active cube.
    pub fn starter() -> Self {
        let mut scene = Self::new("Scene");
        scene.insert(ObjectKind::Camera, None, [7.36, -6.93, 4.96]);
        scene.insert(ObjectKind::Light, None, [4.08, 1.01, 5.9]);
        let cube = scene.insert(ObjectKind::Cube, None, [0.0; 3]);
        scene.selected = vec![cube.clone()];
        scene.active = Some(cube);
        scene
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn get(&self, name: &str) -> Result<&SceneObject> {
        match self.objects.iter().find(|o| o.name == name) {
            Some(object) => Ok(object),
            None => bail!("Object not found: {}", name),
        }
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut SceneObject> {
        match self.objects.iter_mut().find(|o| o.name == name) {
            Some(object) => Ok(object),
            None => bail!("Object not found: {}", name),
        }
    }

    /// Add an object and return its final name. Taken names get a numeric
    /// suffix: `Cube`, `Cube.001`, `Cube.002`.
    pub fn insert(&mut self, kind: ObjectKind, name: Option<&str>, location: [f64; 3]) -> String {
        let base = name.unwrap_or(kind.base_name());
        let name = self.unique_name(base);
        self.objects.push(SceneObject {
            name: name.clone(),
            kind,
            location,
            rotation: [0.0; 3],
            scale: [1.0; 3],
            color: [0.8, 0.8, 0.8, 1.0],
        });
        name
    }

    pub fn remove(&mut self, name: &str) -> Result<SceneObject> {
        let Some(pos) = self.objects.iter().position(|o| o.name == name) else {
            bail!("Object not found: {}", name);
        };
        self.selected.retain(|n| n != name);
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        Ok(self.objects.remove(pos))
    }

    /// Select `names`; the last one becomes active. Unknown names are an
    /// error and leave the selection unchanged.
    pub fn select(&mut self, names: &[String], deselect_others: bool) -> Result<()> {
        for name in names {
            self.get(name)?;
        }
        if deselect_others {
            self.selected.clear();
        }
        for name in names {
            if !self.selected.contains(name) {
                self.selected.push(name.clone());
            }
        }
        if let Some(last) = names.last() {
            self.active = Some(last.clone());
        }
        Ok(())
    }

    fn unique_name(&self, base: &str) -> String {
        let taken = |n: &str| self.objects.iter().any(|o| o.name == n);
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}.{:03}", base, i))
            .find(|n| !taken(n))
            .unwrap_or_else(|| base.to_string())
    }

    fn info(&self) -> Value {
        json!({
            "name": self.name,
            "object_count": self.objects.len(),
            "objects": self.objects.iter().map(|o| json!({
                "name": o.name,
                "type": o.kind,
                "location": o.location,
            })).collect::<Vec<_>>(),
            "selected": self.selected,
            "active_object": self.active,
        })
    }
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ObjectNameArgs {
    object_name: String,
}

#[derive(Debug, Deserialize)]
struct CreateObjectArgs {
    #[serde(rename = "type")]
    kind: ObjectKind,
    name: Option<String>,
    #[serde(default)]
    location: [f64; 3],
    rotation: Option<[f64; 3]>,
    scale: Option<[f64; 3]>,
}

#[derive(Debug, Deserialize)]
struct SelectArgs {
    names: Vec<String>,
    #[serde(default = "default_true")]
    deselect_others: bool,
}

#[derive(Debug, Deserialize)]
struct TransformArgs {
    object_name: String,
    location: Option<[f64; 3]>,
    rotation: Option<[f64; 3]>,
    scale: Option<[f64; 3]>,
}

#[derive(Debug, Deserialize)]
struct ColorArgs {
    object_name: String,
    color: Vec<f64>,
}

fn default_true() -> bool {
    true
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

fn object_name_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "object_name": {"type": "string", "description": "Name of the object"}
        },
        "required": ["object_name"]
    })
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

/// Read-only queries about the scene as a whole.
pub fn common_package() -> ToolPackage<MemoryScene> {
    ToolPackage::new("common", "Scene overview and selection queries")
        .with_tool(HostTool::new(
            "get_scene_info",
            "Get the scene name and a summary of every object in it",
            empty_schema(),
            |scene: &mut MemoryScene, _args| Ok(scene.info()),
        ))
        .with_tool(HostTool::new(
            "get_selected_objects_names",
            "Get the names of the selected objects",
            empty_schema(),
            |scene: &mut MemoryScene, _args| Ok(json!({"names": scene.selected})),
        ))
        .with_tool(HostTool::new(
            "get_active_object_name",
            "Get the name of the active object, or null if there is none",
            empty_schema(),
            |scene: &mut MemoryScene, _args| Ok(json!({"name": scene.active})),
        ))
}

/// Per-object inspection and editing.
pub fn object_package() -> ToolPackage<MemoryScene> {
    ToolPackage::new("object", "Create, inspect and edit scene objects")
        .with_tool(HostTool::new(
            "get_object_info",
            "Get the type, transform and color of an object",
            object_name_schema(),
            |scene: &mut MemoryScene, args| {
                let args: ObjectNameArgs = parse_args(args)?;
                Ok(serde_json::to_value(scene.get(&args.object_name)?)?)
            },
        ))
        .with_tool(HostTool::new(
            "create_object",
            "Create an object. Taken names get a numeric suffix; the final name is returned",
            json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["cube", "sphere", "cylinder", "cone", "torus", "plane", "light", "camera", "empty"]
                    },
                    "name": {"type": "string"},
                    "location": vec3_schema("Location [x, y, z]"),
                    "rotation": vec3_schema("Euler rotation in radians"),
                    "scale": vec3_schema("Scale [x, y, z]")
                },
                "required": ["type"]
            }),
            |scene: &mut MemoryScene, args| {
                let args: CreateObjectArgs = parse_args(args)?;
                let name = scene.insert(args.kind, args.name.as_deref(), args.location);
                let object = scene.get_mut(&name)?;
                if let Some(rotation) = args.rotation {
                    object.rotation = rotation;
                }
                if let Some(scale) = args.scale {
                    object.scale = scale;
                }
                Ok(json!({"name": name}))
            },
        ))
        .with_tool(HostTool::new(
            "delete_object",
            "Delete an object by name",
            object_name_schema(),
            |scene: &mut MemoryScene, args| {
                let args: ObjectNameArgs = parse_args(args)?;
                let removed = scene.remove(&args.object_name)?;
                Ok(json!({"deleted": removed.name}))
            },
        ))
        .with_tool(HostTool::new(
            "select_objects",
            "Select objects by name. The last name becomes the active object",
            json!({
                "type": "object",
                "properties": {
                    "names": {"type": "array", "items": {"type": "string"}},
                    "deselect_others": {"type": "boolean", "default": true}
                },
                "required": ["names"]
            }),
            |scene: &mut MemoryScene, args| {
                let args: SelectArgs = parse_args(args)?;
                scene.select(&args.names, args.deselect_others)?;
                Ok(json!({"selected": scene.selected}))
            },
        ))
        .with_tool(HostTool::new(
            "set_object_transform",
            "Set any of location, rotation and scale of an object",
            json!({
                "type": "object",
                "properties": {
                    "object_name": {"type": "string"},
                    "location": vec3_schema("Location [x, y, z]"),
                    "rotation": vec3_schema("Euler rotation in radians"),
                    "scale": vec3_schema("Scale [x, y, z]")
                },
                "required": ["object_name"]
            }),
            |scene: &mut MemoryScene, args| {
                let args: TransformArgs = parse_args(args)?;
                let object = scene.get_mut(&args.object_name)?;
                if let Some(location) = args.location {
                    object.location = location;
                }
                if let Some(rotation) = args.rotation {
                    object.rotation = rotation;
                }
                if let Some(scale) = args.scale {
                    object.scale = scale;
                }
                Ok(serde_json::to_value(&*object)?)
            },
        ))
        .with_tool(HostTool::new(
            "set_object_color",
            "Set the base color of an object as RGB or RGBA in 0..1",
            json!({
                "type": "object",
                "properties": {
                    "object_name": {"type": "string"},
                    "color": {"type": "array", "items": {"type": "number"}, "minItems": 3, "maxItems": 4}
                },
                "required": ["object_name", "color"]
            }),
            |scene: &mut MemoryScene, args| {
                let args: ColorArgs = parse_args(args)?;
                let color = match args.color.as_slice() {
                    [r, g, b] => [*r, *g, *b, 1.0],
                    [r, g, b, a] => [*r, *g, *b, *a],
                    other => bail!("color needs 3 or 4 components, got {}", other.len()),
                };
                if color.iter().any(|c| !(0.0..=1.0).contains(c)) {
                    bail!("color components must be within 0..1");
                }
                let object = scene.get_mut(&args.object_name)?;
                object.color = color;
                Ok(json!({"name": object.name, "color": object.color}))
            },
        ))
}

pub fn packages() -> Vec<ToolPackage<MemoryScene>> {
    vec![common_package(), object_package()]
}
