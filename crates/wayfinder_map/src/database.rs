//! On-disk map and label databases.
//!
//! Both databases are JSON objects living in a data directory. The map file
//! maps vnum → room record with a `schema_version` key alongside the vnums;
//! the label file is a flat label → vnum map with the same version key.
//! Loading prefers the user's file and falls back to the shipped `.sample`;
//! labels merge sample first, then the user's file on top. Schema-0 files
//! are migrated field by field on load. Any record that fails typed parsing
//! refuses the whole file, which is what falls back to the sample.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::room::{
    Direction, DoorFlag, Exit, ExitDestination, ExitFlag, Light, LoadFlag, MobFlag, Portable,
    Ridable, Room, RoomAlign, Sundeath, Terrain,
};

pub const MAP_FILE: &str = "map.json";
pub const LABELS_FILE: &str = "room_labels.json";

/// Bumped when the map record layout changes. Version 2 added `area` and
/// `server_id`.
pub const MAP_SCHEMA_VERSION: u64 = 2;
pub const LABELS_SCHEMA_VERSION: u64 = 0;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("'{0}' doesn't exist")]
    Missing(PathBuf),
    #[error("'{0}' is a directory, not a file")]
    IsDirectory(PathBuf),
    #[error("corrupted database file '{path}': {detail}")]
    Corrupted { path: PathBuf, detail: String },
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug)]
pub struct LoadedRooms {
    pub rooms: HashMap<String, Room>,
    pub schema_version: u64,
}

impl LoadedRooms {
    pub fn schema_label(&self) -> String {
        if self.schema_version == MAP_SCHEMA_VERSION {
            "latest".to_owned()
        } else {
            format!("V{}", self.schema_version)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ExitRecord {
    door: String,
    door_flags: Vec<DoorFlag>,
    exit_flags: Vec<ExitFlag>,
    to: ExitDestination,
}

#[derive(Serialize, Deserialize)]
struct RoomRecord {
    alignment: RoomAlign,
    #[serde(default)]
    area: String,
    avoid: bool,
    contents: String,
    coordinates: (i64, i64, i64),
    description: String,
    exits: BTreeMap<Direction, ExitRecord>,
    light: Light,
    load_flags: Vec<LoadFlag>,
    mob_flags: Vec<MobFlag>,
    name: String,
    note: String,
    portable: Portable,
    ridable: Ridable,
    #[serde(default = "default_server_id")]
    server_id: String,
    sundeath: Sundeath,
    terrain: Terrain,
}

fn default_server_id() -> String {
    "0".to_owned()
}

impl RoomRecord {
    fn into_room(self, vnum: &str) -> Room {
        let mut room = Room::new(vnum);
        room.align = self.alignment;
        room.area = self.area;
        room.avoid = self.avoid;
        room.dynamic_desc = self.contents;
        room.set_coordinates(self.coordinates);
        room.desc = self.description;
        for (direction, record) in self.exits {
            let mut exit = Exit::new(record.to);
            exit.door = record.door;
            exit.door_flags = record.door_flags.into_iter().collect();
            exit.exit_flags = record.exit_flags.into_iter().collect();
            exit.exit_flags.insert(ExitFlag::Exit);
            room.exits.insert(direction, exit);
        }
        room.light = self.light;
        room.load_flags = self.load_flags.into_iter().collect();
        room.mob_flags = self.mob_flags.into_iter().collect();
        room.name = self.name;
        room.note = self.note;
        room.portable = self.portable;
        room.ridable = self.ridable;
        room.server_id = self.server_id;
        room.sundeath = self.sundeath;
        room.terrain = self.terrain;
        room.calculate_cost();
        room
    }

    fn from_room(room: &Room) -> Self {
        Self {
            alignment: room.align,
            area: room.area.clone(),
            avoid: room.avoid,
            contents: room.dynamic_desc.clone(),
            coordinates: room.coordinates(),
            description: room.desc.clone(),
            exits: room
                .exits
                .iter()
                .map(|(direction, exit)| {
                    (
                        *direction,
                        ExitRecord {
                            door: exit.door.clone(),
                            door_flags: exit.door_flags.iter().copied().collect(),
                            exit_flags: exit.exit_flags.iter().copied().collect(),
                            to: exit.to.clone(),
                        },
                    )
                })
                .collect(),
            light: room.light,
            load_flags: room.load_flags.iter().copied().collect(),
            mob_flags: room.mob_flags.iter().copied().collect(),
            name: room.name.clone(),
            note: room.note.clone(),
            portable: room.portable,
            ridable: room.ridable,
            server_id: room.server_id.clone(),
            sundeath: room.sundeath,
            terrain: room.terrain,
        }
    }
}

/// Loads the rooms database, preferring the user's file over the sample.
pub fn load_rooms(data_dir: &Path) -> Result<LoadedRooms, DatabaseError> {
    let mut errors = Vec::new();
    for name in [MAP_FILE.to_owned(), format!("{MAP_FILE}.sample")] {
        let path = data_dir.join(&name);
        match load_map_file(&path) {
            Ok(loaded) => return Ok(loaded),
            Err(error) => {
                let kind = if name.ends_with(".sample") {
                    "sample"
                } else {
                    "user"
                };
                errors.push(format!("While loading {kind} map: {error}"));
            }
        }
    }
    Err(DatabaseError::Unavailable(errors.join("\n")))
}

fn load_map_file(path: &Path) -> Result<LoadedRooms, DatabaseError> {
    let mut value = read_json(path)?;
    let schema_version = take_schema_version(&mut value);
    let object = match value {
        Value::Object(object) => object,
        _ => {
            return Err(DatabaseError::Corrupted {
                path: path.to_owned(),
                detail: "top level is not an object".to_owned(),
            })
        }
    };
    let rooms = match schema_version {
        0 => migrate_v0(object),
        1 | 2 => {
            let mut rooms = HashMap::with_capacity(object.len());
            for (vnum, record) in object {
                let record: RoomRecord =
                    serde_json::from_value(record).map_err(|error| DatabaseError::Corrupted {
                        path: path.to_owned(),
                        detail: format!("room '{vnum}': {error}"),
                    })?;
                rooms.insert(vnum.clone(), record.into_room(&vnum));
            }
            rooms
        }
        other => return Err(DatabaseError::UnsupportedSchema(other)),
    };
    Ok(LoadedRooms {
        rooms,
        schema_version,
    })
}

/// Saves the rooms database with sorted keys, two-space indentation, and LF
/// line endings.
pub fn save_rooms(data_dir: &Path, rooms: &HashMap<String, Room>) -> Result<(), DatabaseError> {
    let mut output: BTreeMap<String, Value> = rooms
        .iter()
        .map(|(vnum, room)| {
            let record = RoomRecord::from_room(room);
            (
                vnum.clone(),
                serde_json::to_value(record).expect("room records always serialize"),
            )
        })
        .collect();
    output.insert(
        "schema_version".to_owned(),
        Value::Number(MAP_SCHEMA_VERSION.into()),
    );
    write_json(&data_dir.join(MAP_FILE), &output)
}

/// Loads the labels database. The sample's definitions are loaded first and
/// the user's merged over them.
pub fn load_labels(data_dir: &Path) -> Result<BTreeMap<String, String>, DatabaseError> {
    let mut errors = Vec::new();
    let mut labels = BTreeMap::new();
    let mut loaded_any = false;
    for name in [format!("{LABELS_FILE}.sample"), LABELS_FILE.to_owned()] {
        let path = data_dir.join(&name);
        match load_labels_file(&path) {
            Ok(found) => {
                labels.extend(found);
                loaded_any = true;
            }
            Err(error) => {
                let kind = if name.ends_with(".sample") {
                    "sample"
                } else {
                    "user"
                };
                errors.push(format!("While loading {kind} labels: {error}"));
            }
        }
    }
    if loaded_any {
        Ok(labels)
    } else {
        Err(DatabaseError::Unavailable(errors.join("\n")))
    }
}

fn load_labels_file(path: &Path) -> Result<BTreeMap<String, String>, DatabaseError> {
    let mut value = read_json(path)?;
    take_schema_version(&mut value);
    let object = match value {
        Value::Object(object) => object,
        _ => {
            return Err(DatabaseError::Corrupted {
                path: path.to_owned(),
                detail: "top level is not an object".to_owned(),
            })
        }
    };
    let mut labels = BTreeMap::new();
    for (label, vnum) in object {
        match vnum {
            Value::String(vnum) => {
                labels.insert(label, vnum);
            }
            other => {
                return Err(DatabaseError::Corrupted {
                    path: path.to_owned(),
                    detail: format!("label '{label}' maps to non-string {other}"),
                })
            }
        }
    }
    Ok(labels)
}

pub fn save_labels(
    data_dir: &Path,
    labels: &BTreeMap<String, String>,
) -> Result<(), DatabaseError> {
    let mut output: BTreeMap<String, Value> = labels
        .iter()
        .map(|(label, vnum)| (label.clone(), Value::String(vnum.clone())))
        .collect();
    output.insert(
        "schema_version".to_owned(),
        Value::Number(LABELS_SCHEMA_VERSION.into()),
    );
    write_json(&data_dir.join(LABELS_FILE), &output)
}

fn read_json(path: &Path) -> Result<Value, DatabaseError> {
    if !path.exists() {
        return Err(DatabaseError::Missing(path.to_owned()));
    }
    if path.is_dir() {
        return Err(DatabaseError::IsDirectory(path.to_owned()));
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|error| DatabaseError::Corrupted {
        path: path.to_owned(),
        detail: error.to_string(),
    })
}

fn write_json(path: &Path, value: &BTreeMap<String, Value>) -> Result<(), DatabaseError> {
    let mut text = serde_json::to_string_pretty(value).expect("JSON maps always serialize");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

fn take_schema_version(value: &mut Value) -> u64 {
    value
        .as_object_mut()
        .and_then(|object| object.remove("schema_version"))
        .and_then(|version| version.as_u64())
        .unwrap_or(0)
}

// --- legacy (schema 0) migration -------------------------------------------

/// Builds rooms from a legacy file: old field names, unnormalized flag
/// spellings, and per-axis coordinates. Rooms with death terrains or
/// non-decimal vnums are dropped.
fn migrate_v0(object: serde_json::Map<String, Value>) -> HashMap<String, Room> {
    let mut rooms = HashMap::with_capacity(object.len());
    for (vnum, record) in object {
        if !vnum.chars().all(|c| c.is_ascii_digit()) {
            debug!(vnum, "skipping legacy room with non-decimal vnum");
            continue;
        }
        if v0_str(&record, "terrain").is_some_and(|terrain| terrain.starts_with("death")) {
            debug!(vnum, "dropping legacy room with death terrain");
            continue;
        }
        let mut room = Room::new(vnum.as_str());
        room.align = v0_enum(&record, "align", &[], RoomAlign::Undefined);
        room.avoid = record.get("avoid").and_then(Value::as_bool).unwrap_or(false);
        room.desc = v0_str(&record, "desc").unwrap_or_default().to_owned();
        room.dynamic_desc = v0_str(&record, "dynamicDesc").unwrap_or_default().to_owned();
        if let Some(exits) = record.get("exits").and_then(Value::as_object) {
            for (direction, exit_record) in exits {
                let Ok(direction) = direction.parse::<Direction>() else {
                    warn!(vnum, direction, "dropping legacy exit with bad direction");
                    continue;
                };
                room.exits.insert(direction, migrate_v0_exit(exit_record));
            }
        }
        room.light = v0_enum(&record, "light", &[], Light::Undefined);
        room.load_flags = v0_flags_value(
            &record,
            "loadFlags",
            &[
                ("packhorse", "pack_horse"),
                ("trainedhorse", "trained_horse"),
            ],
        );
        room.mob_flags = v0_flags_value(
            &record,
            "mobFlags",
            &[
                ("any", "passive_mob"),
                ("smob", "aggressive_mob"),
                ("quest", "quest_mob"),
                ("scoutguild", "scout_guild"),
                ("mageguild", "mage_guild"),
                ("clericguild", "cleric_guild"),
                ("warriorguild", "warrior_guild"),
                ("rangerguild", "ranger_guild"),
                ("armourshop", "armour_shop"),
                ("foodshop", "food_shop"),
                ("petshop", "pet_shop"),
                ("weaponshop", "weapon_shop"),
            ],
        );
        room.name = v0_str(&record, "name").unwrap_or_default().to_owned();
        room.note = v0_str(&record, "note").unwrap_or_default().to_owned();
        room.portable = v0_enum(
            &record,
            "portable",
            &[("notportable", "not_portable")],
            Portable::Undefined,
        );
        room.ridable = v0_enum(
            &record,
            "ridable",
            &[("notridable", "not_ridable")],
            Ridable::Undefined,
        );
        room.sundeath = v0_enum(&record, "sundeath", &[], Sundeath::Undefined);
        room.terrain = v0_enum(
            &record,
            "terrain",
            &[
                ("indoors", "building"),
                ("random", "undefined"),
                ("shallow", "shallows"),
                ("shallowwater", "shallows"),
            ],
            Terrain::Undefined,
        );
        room.x = record.get("x").and_then(Value::as_i64).unwrap_or(0);
        room.y = record.get("y").and_then(Value::as_i64).unwrap_or(0);
        room.z = record.get("z").and_then(Value::as_i64).unwrap_or(0);
        room.calculate_cost();
        rooms.insert(vnum, room);
    }
    rooms
}

fn migrate_v0_exit(record: &Value) -> Exit {
    let to = v0_str_value(record, "to")
        .map(|to| ExitDestination::from_text(&to))
        .unwrap_or_default();
    let mut exit = Exit::new(to);
    exit.door = v0_str_value(record, "door").unwrap_or_default();
    exit.door_flags = v0_flags_value(
        record,
        "doorFlags",
        &[
            ("noblock", "no_block"),
            ("nobreak", "no_break"),
            ("nopick", "no_pick"),
            ("needkey", "need_key"),
        ],
    );
    exit.exit_flags = v0_flags_value(record, "exitFlags", &[]);
    exit.exit_flags.insert(ExitFlag::Exit);
    exit
}

fn v0_str<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

fn v0_str_value(record: &Value, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Reads a legacy enum field, applying spelling replacements first.
fn v0_enum<T: std::str::FromStr + Copy>(
    record: &Value,
    key: &str,
    replacements: &[(&str, &str)],
    fallback: T,
) -> T {
    let Some(text) = v0_str(record, key) else {
        return fallback;
    };
    let text = replace_spelling(text, replacements);
    match text.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, text, "unrecognized legacy value, using default");
            fallback
        }
    }
}

fn v0_flags_value<T: std::str::FromStr + Ord>(
    record: &Value,
    key: &str,
    replacements: &[(&str, &str)],
) -> std::collections::BTreeSet<T> {
    v0_flag_array(record.get(key), replacements)
}

fn v0_flag_array<T: std::str::FromStr + Ord>(
    flags: Option<&Value>,
    replacements: &[(&str, &str)],
) -> std::collections::BTreeSet<T> {
    let mut out = std::collections::BTreeSet::new();
    let Some(flags) = flags.and_then(Value::as_array) else {
        return out;
    };
    for flag in flags {
        let Some(text) = flag.as_str() else { continue };
        let text = replace_spelling(text, replacements);
        match text.parse() {
            Ok(value) => {
                out.insert(value);
            }
            Err(_) => warn!(flag = text, "dropping unrecognized legacy flag"),
        }
    }
    out
}

fn replace_spelling(text: &str, replacements: &[(&str, &str)]) -> String {
    for (old, new) in replacements {
        if text == *old {
            return (*new).to_owned();
        }
    }
    text.to_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample_room() -> Room {
        let mut room = Room::new("0");
        room.name = "The Great Gate".to_owned();
        room.desc = "A mighty gate.".to_owned();
        room.area = "moria".to_owned();
        room.server_id = "12345".to_owned();
        room.terrain = Terrain::City;
        room.light = Light::Dark;
        room.mob_flags.insert(MobFlag::Rent);
        room.load_flags.insert(LoadFlag::PackHorse);
        room.set_coordinates((5, -3, 1));
        let mut exit = Exit::new(ExitDestination::Room("1".to_owned()));
        exit.door = "gate".to_owned();
        exit.exit_flags.insert(ExitFlag::Door);
        exit.door_flags.insert(DoorFlag::Hidden);
        room.exits.insert(Direction::East, exit);
        room.calculate_cost();
        room
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut rooms = HashMap::new();
        rooms.insert("0".to_owned(), sample_room());
        save_rooms(dir.path(), &rooms).unwrap();

        let loaded = load_rooms(dir.path()).unwrap();
        assert_eq!(loaded.schema_version, MAP_SCHEMA_VERSION);
        let room = &loaded.rooms["0"];
        assert_eq!(room.name, "The Great Gate");
        assert_eq!(room.server_id, "12345");
        assert_eq!(room.coordinates(), (5, -3, 1));
        assert_eq!(room.terrain, Terrain::City);
        let exit = &room.exits[&Direction::East];
        assert_eq!(exit.to, ExitDestination::Room("1".to_owned()));
        assert!(exit.door_flags.contains(&DoorFlag::Hidden));
        assert!(exit.exit_flags.contains(&ExitFlag::Exit));

        // Saving what was loaded must reproduce the identical file.
        let first = std::fs::read_to_string(dir.path().join(MAP_FILE)).unwrap();
        save_rooms(dir.path(), &loaded.rooms).unwrap();
        let second = std::fs::read_to_string(dir.path().join(MAP_FILE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn falls_back_to_sample_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut rooms = HashMap::new();
        rooms.insert("0".to_owned(), sample_room());
        save_rooms(dir.path(), &rooms).unwrap();
        std::fs::rename(
            dir.path().join(MAP_FILE),
            dir.path().join(format!("{MAP_FILE}.sample")),
        )
        .unwrap();
        let loaded = load_rooms(dir.path()).unwrap();
        assert_eq!(loaded.rooms.len(), 1);
    }

    #[test]
    fn corrupt_user_map_reports_both_attempts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MAP_FILE), "{not json").unwrap();
        let error = load_rooms(dir.path()).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("user map"), "{message}");
        assert!(message.contains("sample map"), "{message}");
    }

    #[test]
    fn legacy_v0_fields_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = json!({
            "100": {
                "align": "good",
                "desc": "An old road.",
                "dynamicDesc": "A cart stands here.\n",
                "exits": {
                    "north": {
                        "to": "101",
                        "door": "",
                        "doorFlags": ["noblock"],
                        "exitFlags": ["exit", "road"],
                    },
                },
                "light": "lit",
                "loadFlags": ["packhorse"],
                "mobFlags": ["smob", "weaponshop"],
                "name": "Old Road",
                "note": "",
                "portable": "notportable",
                "ridable": "notridable",
                "terrain": "indoors",
                "x": 1, "y": 2, "z": 3,
            },
            "101": {
                "align": "undefined",
                "desc": "",
                "dynamicDesc": "",
                "exits": {},
                "light": "undefined",
                "loadFlags": [],
                "mobFlags": [],
                "name": "Pit",
                "note": "",
                "portable": "undefined",
                "ridable": "undefined",
                "terrain": "deathtrap",
                "x": 0, "y": 0, "z": 0,
            },
        });
        std::fs::write(
            dir.path().join(MAP_FILE),
            serde_json::to_string(&legacy).unwrap(),
        )
        .unwrap();

        let loaded = load_rooms(dir.path()).unwrap();
        assert_eq!(loaded.schema_version, 0);
        // Death-terrain rooms are silently dropped.
        assert_eq!(loaded.rooms.len(), 1);
        let room = &loaded.rooms["100"];
        assert_eq!(room.terrain, Terrain::Building);
        assert_eq!(room.portable, Portable::NotPortable);
        assert_eq!(room.ridable, Ridable::NotRidable);
        assert!(room.load_flags.contains(&LoadFlag::PackHorse));
        assert!(room.mob_flags.contains(&MobFlag::AggressiveMob));
        assert!(room.mob_flags.contains(&MobFlag::WeaponShop));
        let exit = &room.exits[&Direction::North];
        assert!(exit.door_flags.contains(&DoorFlag::NoBlock));
        assert!(exit.exit_flags.contains(&ExitFlag::Road));
        assert_eq!(room.coordinates(), (1, 2, 3));
        // Saving rewrites the file with the current schema.
        save_rooms(dir.path(), &loaded.rooms).unwrap();
        let reloaded = load_rooms(dir.path()).unwrap();
        assert_eq!(reloaded.schema_version, MAP_SCHEMA_VERSION);
    }

    #[test]
    fn labels_merge_sample_then_user() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(format!("{LABELS_FILE}.sample")),
            serde_json::to_string(&json!({"home": "1", "shop": "2", "schema_version": 0}))
                .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(LABELS_FILE),
            serde_json::to_string(&json!({"home": "5", "schema_version": 0})).unwrap(),
        )
        .unwrap();
        let labels = load_labels(dir.path()).unwrap();
        assert_eq!(labels["home"], "5", "user labels override the sample");
        assert_eq!(labels["shop"], "2");
    }

    #[test]
    fn unknown_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MAP_FILE),
            serde_json::to_string(&json!({"schema_version": 99})).unwrap(),
        )
        .unwrap();
        assert!(load_rooms(dir.path()).is_err());
    }
}
