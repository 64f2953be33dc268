//! Script objects.
//!
//! Objects are owned by the [`ObjectRegistry`] and addressed by numeric id;
//! scripts refer to them by id or by name. Dynamic fields are stored as
//! strings under case-insensitive keys.

use std::collections::HashMap;

/// First id handed out to a script object.
pub const FIRST_OBJECT_ID: u32 = 2000;

/// Classes `new` can instantiate, with the class each derives from.
const CLASSES: &[(&str, Option<&str>)] = &[
    ("SimObject", None),
    ("SimSet", Some("SimObject")),
    ("SimGroup", Some("SimSet")),
    ("ScriptObject", Some("SimObject")),
    ("ScriptGroup", Some("SimGroup")),
];

/// Canonical spelling of a known class name.
pub fn class_name(class: &str) -> Option<&'static str> {
    CLASSES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(class))
        .map(|(name, _)| *name)
}

/// Parent class of a known class.
pub fn parent_class(class: &str) -> Option<&'static str> {
    CLASSES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(class))
        .and_then(|(_, parent)| *parent)
}

#[derive(Debug, Clone)]
pub struct SimObject {
    pub id: u32,
    pub name: Option<String>,
    pub class: &'static str,
    fields: HashMap<String, (String, String)>,
    pub children: Vec<u32>,
    pub parent: Option<u32>,
}

impl SimObject {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Setting a field to the empty string removes it.
    pub fn set_field(&mut self, name: &str, value: String) {
        let key = name.to_ascii_lowercase();
        if value.is_empty() {
            self.fields.remove(&key);
        } else {
            self.fields.insert(key, (name.to_string(), value));
        }
    }

    /// Field names in their first-assigned spelling, sorted.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fields.values().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable_by_key(|n| n.to_ascii_lowercase());
        names
    }
}

#[derive(Debug)]
pub struct ObjectRegistry {
    objects: HashMap<u32, SimObject>,
    names: HashMap<String, u32>,
    next_id: u32,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            names: HashMap::new(),
            next_id: FIRST_OBJECT_ID,
        }
    }

    /// Create an object of a known class. Returns `None` for unknown classes.
    pub fn create(&mut self, class: &str, name: Option<&str>) -> Option<u32> {
        let class = class_name(class)?;
        let id = self.next_id;
        self.next_id += 1;
        let name = name.filter(|n| !n.is_empty()).map(str::to_string);
        if let Some(name) = &name {
            self.names.insert(name.to_ascii_lowercase(), id);
        }
        self.objects.insert(
            id,
            SimObject {
                id,
                name,
                class,
                fields: HashMap::new(),
                children: Vec::new(),
                parent: None,
            },
        );
        Some(id)
    }

    /// Resolve an object reference: a numeric id, a name, or `/`-prefixed name.
    pub fn find(&self, reference: &str) -> Option<u32> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        if reference.bytes().all(|b| b.is_ascii_digit()) {
            let id = reference.parse().ok()?;
            return self.objects.contains_key(&id).then_some(id);
        }
        let name = reference.strip_prefix('/').unwrap_or(reference);
        self.names.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn get(&self, id: u32) -> Option<&SimObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut SimObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether objects of this id's class can hold children.
    pub fn is_group(&self, id: u32) -> bool {
        let Some(obj) = self.objects.get(&id) else {
            return false;
        };
        let mut class = Some(obj.class);
        while let Some(c) = class {
            if c == "SimSet" {
                return true;
            }
            class = parent_class(c);
        }
        false
    }

    /// Move `child` under `parent`, detaching it from any previous parent.
    pub fn add_child(&mut self, parent: u32, child: u32) -> bool {
        if parent == child || !self.contains(child) || !self.is_group(parent) {
            return false;
        }
        self.detach(child);
        if let Some(p) = self.objects.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.objects.get_mut(&child) {
            c.parent = Some(parent);
        }
        true
    }

    fn detach(&mut self, child: u32) {
        let old = self.objects.get(&child).and_then(|c| c.parent);
        if let Some(old) = old.and_then(|p| self.objects.get_mut(&p)) {
            old.children.retain(|&c| c != child);
        }
        if let Some(c) = self.objects.get_mut(&child) {
            c.parent = None;
        }
    }

    /// Delete an object and, recursively, its children.
    pub fn delete(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.detach(id);
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(obj) = self.objects.remove(&next) {
                if let Some(name) = &obj.name {
                    let key = name.to_ascii_lowercase();
                    if self.names.get(&key) == Some(&next) {
                        self.names.remove(&key);
                    }
                }
                pending.extend(obj.children);
            }
        }
        true
    }
}
