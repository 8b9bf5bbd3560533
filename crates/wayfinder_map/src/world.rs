//! The room store and the map editing command vocabulary.
//!
//! `World` owns every room and exit. Exits refer to their destination by
//! vnum, so the cyclic graph lives in one flat map and deletion only has to
//! rewrite incoming links. The editing commands mirror the user command
//! surface: each returns the message to show the player and mutates nothing
//! when its preconditions fail.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::warn;

use crate::database::{self, DatabaseError};
use crate::room::{
    Direction, DoorFlag, Exit, ExitDestination, ExitFlag, Light, LoadFlag, MobFlag, Portable,
    Ridable, Room, RoomAlign, Sundeath, Terrain, NO_LOCATION,
};

/// Criteria for [`World::search_rooms`]. A room matches when every provided
/// field matches.
#[derive(Default)]
pub struct RoomFilter<'a> {
    /// Text fields must match exactly instead of by substring.
    pub exact: bool,
    pub area: Option<&'a str>,
    pub server_id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub desc: Option<&'a str>,
    pub dynamic_desc: Option<&'a str>,
    pub note: Option<&'a str>,
    /// Matches rooms where any exit's door name contains the text.
    pub door: Option<&'a str>,
}

pub struct World {
    pub rooms: HashMap<String, Room>,
    /// Human-readable label → vnum.
    pub labels: BTreeMap<String, String>,
    /// The sync engine's current location; [`NO_LOCATION`] when lost.
    pub current_vnum: String,
    pub is_synced: bool,
}

impl World {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            labels: BTreeMap::new(),
            current_vnum: NO_LOCATION.to_owned(),
            is_synced: false,
        }
    }

    /// Loads the map and label databases, reporting progress messages.
    pub fn load(&mut self, data_dir: &Path) -> Vec<String> {
        let mut messages = vec!["Loading the database file.".to_owned()];
        match database::load_rooms(data_dir) {
            Ok(loaded) => {
                messages.push(format!(
                    "Creating room objects with {} schema.",
                    loaded.schema_label()
                ));
                self.rooms = loaded.rooms;
                if self.rooms.contains_key("0") {
                    self.current_vnum = "0".to_owned();
                }
                messages.push(format!("Map database loaded: {} rooms.", self.rooms.len()));
            }
            Err(error) => messages.push(format!("While loading map: {error}")),
        }
        match database::load_labels(data_dir) {
            Ok(labels) => {
                self.labels = labels;
                let orphans: Vec<String> = self
                    .labels
                    .iter()
                    .filter(|(_, vnum)| !self.rooms.contains_key(*vnum))
                    .map(|(label, _)| label.clone())
                    .collect();
                if !orphans.is_empty() {
                    for label in &orphans {
                        self.labels.remove(label);
                    }
                    messages.push(format!("Detected orphan labels: {}", orphans.join(", ")));
                    messages.push(format!("{} orphan labels removed.", orphans.len()));
                }
                messages.push("Loaded room labels.".to_owned());
            }
            Err(error) => messages.push(format!("While loading labels: {error}")),
        }
        messages
    }

    /// Saves the map database.
    pub fn save(&self, data_dir: &Path) -> Result<(), DatabaseError> {
        database::save_rooms(data_dir, &self.rooms)
    }

    pub fn current(&self) -> Option<&Room> {
        self.rooms.get(&self.current_vnum)
    }

    pub fn current_mut(&mut self) -> Option<&mut Room> {
        self.rooms.get_mut(&self.current_vnum)
    }

    /// The current room, or a placeholder at the origin when the mapper has
    /// no location. Used as the reference point of find-command output.
    pub fn reference_room(&self) -> Room {
        self.current()
            .cloned()
            .unwrap_or_else(|| Room::new(NO_LOCATION))
    }

    /// The next unused decimal vnum.
    pub fn new_vnum(&self) -> String {
        let highest = self
            .rooms
            .keys()
            .filter_map(|vnum| vnum.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);
        highest.to_string()
    }

    /// True when moving through `exit` and back along the reverse direction
    /// returns to `origin`.
    pub fn is_bidirectional(&self, origin: &str, direction: Direction, exit: &Exit) -> bool {
        let Some(dest_vnum) = exit.to.vnum() else {
            return false;
        };
        let Some(dest) = self.rooms.get(dest_vnum) else {
            return false;
        };
        dest.exits
            .get(&direction.reverse())
            .is_some_and(|back| back.to.vnum() == Some(origin))
    }

    pub fn coordinates_add_direction(
        coordinates: (i64, i64, i64),
        direction: Direction,
    ) -> (i64, i64, i64) {
        let (dx, dy, dz) = direction.offset();
        (
            coordinates.0 + dx,
            coordinates.1 + dy,
            coordinates.2 + dz,
        )
    }

    /// Vnums of every room sitting exactly at `coordinates`.
    pub fn rooms_at(&self, coordinates: (i64, i64, i64)) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.coordinates() == coordinates)
            .map(|(vnum, _)| vnum.clone())
            .collect()
    }

    /// Resolves a vnum or label to a room vnum, or explains what went
    /// wrong, suggesting the closest labels for a near miss.
    pub fn room_from_label(&self, text: &str) -> Result<String, String> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return Err("No label or room vnum specified.".to_owned());
        }
        if text.chars().all(|c| c.is_ascii_digit()) {
            if self.rooms.contains_key(text.as_str()) {
                return Ok(text);
            }
            return Err(format!("No room with vnum {text}."));
        }
        if let Some(vnum) = self.labels.get(&text) {
            if self.rooms.contains_key(vnum) {
                return Ok(vnum.clone());
            }
            return Err(format!(
                "{text} is set to vnum {vnum}, but there is no room with that vnum"
            ));
        }
        let mut candidates: Vec<&String> = self.labels.keys().collect();
        candidates.sort_by_key(|label| levenshtein(label, &text));
        let suggestions: Vec<&str> = candidates.iter().take(4).map(|s| s.as_str()).collect();
        Err(format!(
            "Unknown label. Did you mean {}?",
            suggestions.join(", ")
        ))
    }

    pub fn search_rooms(&self, filter: &RoomFilter<'_>) -> Vec<&Room> {
        fn text_match(data: &str, wanted: Option<&str>, exact: bool) -> bool {
            match wanted {
                None => true,
                Some(wanted) => {
                    let data = data.trim().to_lowercase();
                    let wanted = wanted.trim().to_lowercase();
                    if exact {
                        data == wanted
                    } else {
                        data.contains(&wanted)
                    }
                }
            }
        }

        self.rooms
            .values()
            .filter(|room| {
                text_match(&room.area, filter.area, filter.exact)
                    && text_match(&room.name, filter.name, filter.exact)
                    && text_match(&room.desc, filter.desc, filter.exact)
                    && text_match(&room.dynamic_desc, filter.dynamic_desc, filter.exact)
                    && text_match(&room.note, filter.note, filter.exact)
                    && filter
                        .server_id
                        .is_none_or(|id| room.server_id == id.trim())
                    && filter.door.is_none_or(|door| {
                        room.exits
                            .values()
                            .any(|exit| exit.door.contains(door.trim()))
                    })
            })
            .collect()
    }

    // --- editing commands -------------------------------------------------

    pub fn rdelete(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let vnum = if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
            if !self.rooms.contains_key(text.as_str()) {
                return format!("Error: the vnum '{text}' does not exist.");
            }
            text
        } else if self.is_synced {
            self.current_vnum.clone()
        } else {
            return "Syntax: rdelete [vnum]".to_owned();
        };
        if self.current_vnum == vnum {
            self.is_synced = false;
            self.current_vnum = "0".to_owned();
        }
        let name = self.rooms[&vnum].name.clone();
        for room in self.rooms.values_mut() {
            for exit in room.exits.values_mut() {
                if exit.to.vnum() == Some(vnum.as_str()) {
                    exit.to = ExitDestination::Undefined;
                }
            }
        }
        self.rooms.remove(&vnum);
        format!("Deleting room '{vnum}' with name '{name}'.")
    }

    /// Rewrites a room's vnum, updating every exit that refers to it.
    pub fn revnum(&mut self, text: &str) -> String {
        let words: Vec<&str> = text.split_whitespace().collect();
        let (origin, destination) = match words.as_slice() {
            [destination] => (self.current_vnum.clone(), (*destination).to_owned()),
            [origin, destination] => ((*origin).to_owned(), (*destination).to_owned()),
            _ => return "Syntax: 'revnum [Origin VNum] [Destination VNum]'.".to_owned(),
        };
        if !destination.chars().all(|c| c.is_ascii_digit()) {
            return "Error: destination VNum must be digits.".to_owned();
        }
        if !self.rooms.contains_key(&origin) {
            return format!("Error: the vnum '{origin}' does not exist.");
        }
        if self.rooms.contains_key(&destination) {
            return format!("Error: the vnum '{destination}' already exists.");
        }
        for room in self.rooms.values_mut() {
            for exit in room.exits.values_mut() {
                if exit.to.vnum() == Some(origin.as_str()) {
                    exit.to = ExitDestination::Room(destination.clone());
                }
            }
        }
        let mut room = self.rooms.remove(&origin).expect("checked above");
        room.vnum = destination.clone();
        self.rooms.insert(destination.clone(), room);
        for vnum in self.labels.values_mut() {
            if *vnum == origin {
                *vnum = destination.clone();
            }
        }
        if self.current_vnum == origin {
            self.current_vnum = destination.clone();
        }
        format!("Changed the VNum '{origin}' to '{destination}'.")
    }

    pub fn rnote(&mut self, text: &str) -> String {
        let text = text.trim();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        if text.is_empty() {
            return format!(
                "Room note set to '{}'. Use 'rnote [text]' to change it, 'rnote -a [text]' to \
                 append to it, or 'rnote -r' to remove it.",
                room.note
            );
        }
        if let Some(rest) = text.strip_prefix("-r") {
            if !rest.is_empty() {
                return "Error: '-r' requires no extra arguments. Change aborted.".to_owned();
            }
            room.note.clear();
            return "Note removed.".to_owned();
        }
        if let Some(rest) = text.strip_prefix("-a") {
            let rest = rest.trim();
            if rest.is_empty() {
                return "Error: '-a' requires text to be appended. Change aborted.".to_owned();
            }
            room.note = format!("{} {}", room.note.trim(), rest);
        } else {
            room.note = text.to_owned();
        }
        format!("Room note now set to '{}'.", room.note)
    }

    pub fn ralign(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match text.parse::<RoomAlign>() {
            Ok(value) => {
                room.align = value;
                format!("Setting room align to '{value}'.")
            }
            Err(()) => format!(
                "Room alignment set to '{}'. Use 'ralign [{}]' to change it.",
                room.align,
                RoomAlign::joined(" | ")
            ),
        }
    }

    pub fn rlight(&mut self, text: &str) -> String {
        let text = text.trim();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        if text.is_empty() {
            return format!(
                "Room light set to '{}'. Use 'rlight [{}]' to change it.",
                room.light,
                Light::joined(" | ")
            );
        }
        let value = single_char(text)
            .and_then(Light::from_symbol)
            .or_else(|| text.to_lowercase().parse().ok());
        match value {
            Some(value) => {
                room.light = value;
                format!("Setting room light to '{value}'.")
            }
            None => format!(
                "Invalid value for room light ({text}). Valid values are [{}].",
                Light::joined(" | ")
            ),
        }
    }

    pub fn rportable(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match text.parse::<Portable>() {
            Ok(value) => {
                room.portable = value;
                format!("Setting room portable to '{value}'.")
            }
            Err(()) => format!(
                "Room portable set to '{}'. Use 'rportable [{}]' to change it.",
                room.portable,
                Portable::joined(" | ")
            ),
        }
    }

    pub fn rridable(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match text.parse::<Ridable>() {
            Ok(value) => {
                room.ridable = value;
                room.calculate_cost();
                format!("Setting room ridable to '{value}'.")
            }
            Err(()) => format!(
                "Room ridable set to '{}'. Use 'rridable [{}]' to change it.",
                room.ridable,
                Ridable::joined(" | ")
            ),
        }
    }

    pub fn rsundeath(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match text.parse::<Sundeath>() {
            Ok(value) => {
                room.sundeath = value;
                format!("Setting room sundeath to '{value}'.")
            }
            Err(()) => format!(
                "Room sundeath set to '{}'. Use 'rsundeath [{}]' to change it.",
                room.sundeath,
                Sundeath::joined(" | ")
            ),
        }
    }

    pub fn ravoid(&mut self, text: &str) -> String {
        let text = text.trim();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match text {
            "+" | "-" => {
                room.avoid = text == "+";
                room.calculate_cost();
                format!(
                    "{} room avoid.",
                    if room.avoid { "Enabling" } else { "Disabling" }
                )
            }
            _ => format!(
                "Room avoid {}. Use 'ravoid [+ | -]' to change it.",
                if room.avoid { "enabled" } else { "disabled" }
            ),
        }
    }

    pub fn rterrain(&mut self, text: &str) -> String {
        let text = text.trim();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        if text.is_empty() {
            return format!(
                "Room terrain set to '{}'. Use 'rterrain [{}]' to change it.",
                room.terrain,
                Terrain::joined(" | ")
            );
        }
        let value = single_char(text)
            .and_then(Terrain::from_symbol)
            .or_else(|| text.to_lowercase().parse().ok());
        match value {
            Some(value) => {
                room.terrain = value;
                room.calculate_cost();
                format!("Setting room terrain to '{value}'.")
            }
            None => format!(
                "Invalid value for room terrain ({text}). Valid values are [{}].",
                Terrain::joined(" | ")
            ),
        }
    }

    pub fn rcoordinate(&mut self, axis: char, text: &str) -> String {
        let text = text.trim();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        let slot = match axis {
            'x' => &mut room.x,
            'y' => &mut room.y,
            _ => &mut room.z,
        };
        if text.is_empty() {
            return format!(
                "Room coordinate {} set to '{slot}'. Use 'r{axis} [digit]' to change it.",
                axis.to_uppercase()
            );
        }
        match text.parse::<i64>() {
            Ok(value) => {
                *slot = value;
                format!(
                    "Setting room {} coordinate to '{value}'.",
                    axis.to_uppercase()
                )
            }
            Err(_) => "Error: room coordinates must be comprised of digits only.".to_owned(),
        }
    }

    pub fn rmobflags(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        if let Some((mode, flag)) = parse_mode_and_flag::<MobFlag>(&text) {
            return match mode {
                FlagMode::Remove => {
                    if room.mob_flags.remove(&flag) {
                        format!("Mob flag '{flag}' removed.")
                    } else {
                        format!("Mob flag '{flag}' not set.")
                    }
                }
                FlagMode::Add => {
                    if room.mob_flags.insert(flag) {
                        format!("Mob flag '{flag}' added.")
                    } else {
                        format!("Mob flag '{flag}' already set.")
                    }
                }
            };
        }
        format!(
            "Mob flags set to '{}'. Use 'rmobflags [add | remove] [{}]' to change them.",
            join_display(&room.mob_flags),
            MobFlag::joined(" | ")
        )
    }

    pub fn rloadflags(&mut self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        if let Some((mode, flag)) = parse_mode_and_flag::<LoadFlag>(&text) {
            return match mode {
                FlagMode::Remove => {
                    if room.load_flags.remove(&flag) {
                        format!("Load flag '{flag}' removed.")
                    } else {
                        format!("Load flag '{flag}' not set.")
                    }
                }
                FlagMode::Add => {
                    if room.load_flags.insert(flag) {
                        format!("Load flag '{flag}' added.")
                    } else {
                        format!("Load flag '{flag}' already set.")
                    }
                }
            };
        }
        format!(
            "Load flags set to '{}'. Use 'rloadflags [add | remove] [{}]' to change them.",
            join_display(&room.load_flags),
            LoadFlag::joined(" | ")
        )
    }

    pub fn exitflags(&mut self, text: &str) -> String {
        let syntax = format!(
            "Syntax: 'exitflags [add | remove] [{}] [{}]'.",
            ExitFlag::joined(" | "),
            Direction::joined(" | ")
        );
        let text = text.trim().to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let Some(direction) = words.last().and_then(|word| Direction::from_prefix(word)) else {
            return syntax;
        };
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        let Some(exit) = room.exits.get_mut(&direction) else {
            return format!("Exit {direction} does not exist.");
        };
        match words.as_slice() {
            [_] => format!(
                "Exit flags '{direction}' set to '{}'.",
                join_display(&exit.exit_flags)
            ),
            [mode, flag, _] => {
                let Some(mode) = FlagMode::parse(mode) else {
                    return syntax;
                };
                let Ok(flag) = flag.parse::<ExitFlag>() else {
                    return syntax;
                };
                match mode {
                    FlagMode::Remove => {
                        if exit.exit_flags.remove(&flag) {
                            format!("Exit flag '{flag}' in direction '{direction}' removed.")
                        } else {
                            format!("Exit flag '{flag}' in direction '{direction}' not set.")
                        }
                    }
                    FlagMode::Add => {
                        if exit.exit_flags.insert(flag) {
                            format!("Exit flag '{flag}' in direction '{direction}' added.")
                        } else {
                            format!("Exit flag '{flag}' in direction '{direction}' already set.")
                        }
                    }
                }
            }
            _ => syntax,
        }
    }

    pub fn doorflags(&mut self, text: &str) -> String {
        let syntax = format!(
            "Syntax: 'doorflags [add | remove] [{}] [{}]'.",
            DoorFlag::joined(" | "),
            Direction::joined(" | ")
        );
        let text = text.trim().to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let Some(direction) = words.last().and_then(|word| Direction::from_prefix(word)) else {
            return syntax;
        };
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        let Some(exit) = room.exits.get_mut(&direction) else {
            return format!("Exit {direction} does not exist.");
        };
        match words.as_slice() {
            [_] => format!(
                "Door flags '{direction}' set to '{}'.",
                join_display(&exit.door_flags)
            ),
            [mode, flag, _] => {
                let Some(mode) = FlagMode::parse(mode) else {
                    return syntax;
                };
                let Ok(flag) = flag.parse::<DoorFlag>() else {
                    return syntax;
                };
                match mode {
                    FlagMode::Remove => {
                        if exit.door_flags.remove(&flag) {
                            format!("Door flag '{flag}' in direction '{direction}' removed.")
                        } else {
                            format!("Door flag '{flag}' in direction '{direction}' not set.")
                        }
                    }
                    FlagMode::Add => {
                        if exit.door_flags.insert(flag) {
                            format!("Door flag '{flag}' in direction '{direction}' added.")
                        } else {
                            format!("Door flag '{flag}' in direction '{direction}' already set.")
                        }
                    }
                }
            }
            _ => syntax,
        }
    }

    /// Manages hidden doors: `secret add <name> <direction>`, `secret
    /// remove <direction>`, or `secret <direction>` to query.
    pub fn secret(&mut self, text: &str) -> String {
        let syntax = format!(
            "Syntax: 'secret [add | remove] [name] [{}]'.",
            Direction::joined(" | ")
        );
        let text = text.trim().to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let Some(direction) = words.last().and_then(|word| Direction::from_prefix(word)) else {
            return syntax;
        };
        let Some(room) = self.current_mut() else {
            return no_location();
        };
        match words.as_slice() {
            [mode, name, _] if FlagMode::parse(mode) == Some(FlagMode::Add) => {
                if !name.chars().all(|c| c.is_ascii_alphabetic()) {
                    return "Error: 'add' expects a name for the secret.".to_owned();
                }
                let exit = room.exits.entry(direction).or_default();
                exit.exit_flags.insert(ExitFlag::Door);
                exit.door_flags.insert(DoorFlag::Hidden);
                exit.door = (*name).to_owned();
                format!("Adding secret '{name}' to direction '{direction}'.")
            }
            [mode, _] if FlagMode::parse(mode) == Some(FlagMode::Add) => {
                "Error: 'add' expects a name for the secret.".to_owned()
            }
            [mode, _] if FlagMode::parse(mode) == Some(FlagMode::Remove) => {
                let Some(exit) = room.exits.get_mut(&direction) else {
                    return format!("Exit {direction} does not exist.");
                };
                if exit.door.is_empty() {
                    return format!("No secret {direction} of here.");
                }
                exit.door_flags.remove(&DoorFlag::Hidden);
                exit.door.clear();
                format!("Secret {direction} removed.")
            }
            [_] => {
                let Some(exit) = room.exits.get(&direction) else {
                    return format!("Exit {direction} does not exist.");
                };
                if exit.door.is_empty() {
                    format!("No secret {direction} of here.")
                } else {
                    format!("Exit '{direction}' has secret '{}'.", exit.door)
                }
            }
            _ => syntax,
        }
    }

    /// Manages links: `rlink add [oneway] <vnum|undefined> <direction>`,
    /// `rlink remove <direction>`, or `rlink <direction>` to query.
    pub fn rlink(&mut self, text: &str) -> String {
        let syntax = format!(
            "Syntax: 'rlink [add | remove] [oneway] [vnum] [{}]'.",
            Direction::joined(" | ")
        );
        let text = text.trim().to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let Some(direction) = words.last().and_then(|word| Direction::from_prefix(word)) else {
            return syntax;
        };
        if self.current().is_none() {
            return no_location();
        }

        match words.as_slice() {
            [mode, rest @ .., _] if FlagMode::parse(mode) == Some(FlagMode::Add) => {
                let (oneway, target) = match rest {
                    [oneway, target] if is_prefix_of(oneway, "oneway") => (true, *target),
                    [target] => (false, *target),
                    _ => return "Error: 'add' expects a vnum or 'undefined'.".to_owned(),
                };
                self.link_exit(direction, target, oneway)
            }
            [mode, _] if FlagMode::parse(mode) == Some(FlagMode::Remove) => {
                let room = self.current_mut().expect("checked above");
                if room.exits.remove(&direction).is_none() {
                    return format!("Exit {direction} does not exist.");
                }
                format!("Exit {direction} removed.")
            }
            [_] => {
                let room = self.current().expect("checked above");
                let Some(exit) = room.exits.get(&direction) else {
                    return format!("Exit {direction} does not exist.");
                };
                let to_name = exit
                    .to
                    .vnum()
                    .and_then(|vnum| self.rooms.get(vnum))
                    .map(|room| room.name.clone())
                    .unwrap_or_default();
                format!(
                    "Exit '{direction}' links to '{}' with name '{to_name}'.",
                    exit.to
                )
            }
            _ => syntax,
        }
    }

    fn link_exit(&mut self, direction: Direction, target: &str, oneway: bool) -> String {
        if target == "undefined" {
            let room = self.current_mut().expect("caller checked");
            room.exits.entry(direction).or_default().to = ExitDestination::Undefined;
            return format!("Direction {direction} now undefined.");
        }
        if !target.chars().all(|c| c.is_ascii_digit()) {
            return "Error: 'add' expects a vnum or 'undefined'.".to_owned();
        }
        if !self.rooms.contains_key(target) {
            return format!("Error: vnum {target} not in database.");
        }
        let current_vnum = self.current_vnum.clone();
        let target_name = self.rooms[target].name.clone();
        {
            let room = self.rooms.get_mut(&current_vnum).expect("caller checked");
            room.exits.entry(direction).or_default().to = ExitDestination::Room(target.to_owned());
        }
        if oneway {
            return format!(
                "Linking direction {direction} one way to {target} with name '{target_name}'."
            );
        }
        let reverse = direction.reverse();
        let target_room = self.rooms.get_mut(target).expect("checked above");
        let back_is_free = target_room
            .exits
            .get(&reverse)
            .is_none_or(|exit| exit.to == ExitDestination::Undefined);
        if back_is_free {
            target_room
                .exits
                .insert(reverse, Exit::new(ExitDestination::Room(current_vnum)));
            format!(
                "Linking direction {direction} to {target} with name '{target_name}'.\nLinked \
                 exit {reverse} in second room with this room."
            )
        } else {
            format!(
                "Linking direction {direction} to {target} with name '{target_name}'.\nUnable to \
                 link exit {reverse} in second room with this room: exit already defined."
            )
        }
    }

    pub fn getlabel(&self, text: &str) -> String {
        let text = text.trim();
        let vnum = if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
            text
        } else {
            &self.current_vnum
        };
        let result: Vec<&str> = self
            .labels
            .iter()
            .filter(|(_, target)| *target == vnum)
            .map(|(label, _)| label.as_str())
            .collect();
        if result.is_empty() {
            "Room not labeled.".to_owned()
        } else {
            format!("Room labels: {}", result.join(", "))
        }
    }

    /// Label management; persists the label file on every change.
    pub fn rlabel(&mut self, text: &str, data_dir: &Path) -> String {
        let syntax = "Syntax: 'rlabel [add|info|delete|search] [label] [vnum]'. Vnum is only \
                      used when adding a room. Leave it blank to use the current room's vnum. Use \
                      'rlabel info all' to get a list of all labels.";
        let text = text.trim().to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let (action, label, vnum) = match words.as_slice() {
            [action, label] => (*action, *label, None),
            [action, label, vnum] => (*action, *label, Some(*vnum)),
            _ => return syntax.to_owned(),
        };
        if label == "schema_version" {
            return "Error: 'schema_version' not allowed as label.".to_owned();
        }
        if label.chars().all(|c| c.is_ascii_digit()) {
            return "Labels cannot be decimal values.".to_owned();
        }
        match action {
            "add" => {
                let vnum = match vnum {
                    Some(vnum) if vnum.chars().all(|c| c.is_ascii_digit()) => vnum.to_owned(),
                    Some(_) => return syntax.to_owned(),
                    None => self.current_vnum.clone(),
                };
                self.labels.insert(label.to_owned(), vnum.clone());
                let mut output = format!("Adding the label '{label}' with VNum '{vnum}'.");
                if let Err(error) = database::save_labels(data_dir, &self.labels) {
                    warn!(%error, "unable to save labels");
                    output.push_str(&format!("\nError saving labels: {error}"));
                }
                output
            }
            "delete" => {
                if self.labels.remove(label).is_none() {
                    return format!("There aren't any labels matching '{label}' in the database.");
                }
                let mut output = format!("Deleting label '{label}'.");
                if let Err(error) = database::save_labels(data_dir, &self.labels) {
                    warn!(%error, "unable to save labels");
                    output.push_str(&format!("\nError saving labels: {error}"));
                }
                output
            }
            "info" => {
                if self.labels.is_empty() {
                    "There aren't any labels in the database yet.".to_owned()
                } else if "all".starts_with(label) {
                    self.labels
                        .iter()
                        .map(|(label, vnum)| format!("{label} - {vnum}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                } else if let Some(vnum) = self.labels.get(label) {
                    format!("Label '{label}' points to room '{vnum}'.")
                } else {
                    format!("There aren't any labels matching '{label}' in the database.")
                }
            }
            "search" => {
                let results: Vec<String> = self
                    .labels
                    .iter()
                    .filter(|(name, _)| name.contains(label))
                    .map(|(name, vnum)| {
                        let room_name = self
                            .rooms
                            .get(vnum)
                            .map_or("VNum not in map", |room| room.name.as_str());
                        format!("{name} - {room_name} - {vnum}")
                    })
                    .collect();
                if results.is_empty() {
                    "Nothing found.".to_owned()
                } else {
                    results.join("\n")
                }
            }
            _ => syntax.to_owned(),
        }
    }

    pub fn rinfo(&self, text: &str) -> String {
        let text = text.trim().to_lowercase();
        let mut vnum = if text.is_empty() {
            self.current_vnum.clone()
        } else {
            text
        };
        if let Some(target) = self.labels.get(&vnum) {
            vnum = target.clone();
        }
        match self.rooms.get(&vnum) {
            Some(room) => room.info(),
            None => format!("Error: No such vnum or label, '{vnum}'"),
        }
    }

    // --- find commands ----------------------------------------------------

    pub fn fdoor(&self, find_format: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return "Usage: 'fdoor [text]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            door: Some(text),
            ..RoomFilter::default()
        });
        let needle = text.trim().to_owned();
        self.format_results(find_format, results, move |room| {
            room.exits
                .iter()
                .filter(|(_, exit)| exit.door.contains(&needle))
                .map(|(direction, exit)| format!("{direction}: {}", exit.door))
                .collect::<Vec<_>>()
                .join(", ")
        })
    }

    pub fn fdynamic(&self, find_format: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return "Usage: 'fdynamic [text]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            dynamic_desc: Some(text),
            ..RoomFilter::default()
        });
        self.format_results(find_format, results, |room| room.dynamic_desc.clone())
    }

    pub fn flabel(&self, find_format: &str, text: &str) -> String {
        if self.labels.is_empty() {
            return "No labels defined.".to_owned();
        }
        let needle = text.trim().to_lowercase();
        let mut vnums: Vec<&String> = self
            .labels
            .iter()
            .filter(|(label, _)| needle.is_empty() || label.to_lowercase().contains(&needle))
            .map(|(_, vnum)| vnum)
            .collect();
        vnums.sort();
        vnums.dedup();
        let results: Vec<&Room> = vnums
            .into_iter()
            .filter_map(|vnum| self.rooms.get(vnum))
            .collect();
        if results.is_empty() {
            return "Nothing found.".to_owned();
        }
        self.format_results(find_format, results, |room| self.getlabel(&room.vnum))
    }

    pub fn fname(&self, find_format: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return "Usage: 'fname [text]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            name: Some(text),
            ..RoomFilter::default()
        });
        let redundant = find_format.contains("{name}") && find_format.contains("{attribute}");
        self.format_results(find_format, results, move |room| {
            if redundant {
                String::new()
            } else {
                room.name.clone()
            }
        })
    }

    pub fn fnote(&self, find_format: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return "Usage: 'fnote [text]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            note: Some(text),
            ..RoomFilter::default()
        });
        self.format_results(find_format, results, |room| room.note.clone())
    }

    pub fn farea(&self, find_format: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return "Usage: 'farea [text]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            area: Some(text),
            ..RoomFilter::default()
        });
        self.format_results(find_format, results, |room| room.area.clone())
    }

    pub fn fsid(&self, find_format: &str, text: &str) -> String {
        if !text.trim().chars().all(|c| c.is_ascii_digit()) || text.trim().is_empty() {
            return "Usage: 'fsid [number]'.".to_owned();
        }
        let results = self.search_rooms(&RoomFilter {
            server_id: Some(text),
            ..RoomFilter::default()
        });
        self.format_results(find_format, results, |room| room.server_id.clone())
    }

    /// Renders find-command results: nearest 20 by Manhattan distance,
    /// printed farthest first so the closest match lands at the bottom.
    fn format_results(
        &self,
        find_format: &str,
        mut results: Vec<&Room>,
        attribute: impl Fn(&Room) -> String,
    ) -> String {
        if results.is_empty() {
            return "Nothing found.".to_owned();
        }
        let reference = self.reference_room();
        results.sort_by_key(|room| reference.manhattan_distance(room));
        results.truncate(20);
        results.reverse();
        results
            .iter()
            .map(|room| {
                find_format
                    .replace("{attribute}", &attribute(room))
                    .replace("{direction}", &reference.direction_to(room))
                    .replace("{clockPosition}", &reference.clock_position_to(room))
                    .replace("{distance}", &reference.manhattan_distance(room).to_string())
                    .replace("{vnum}", &room.vnum)
                    .replace("{name}", &room.name)
                    .replace("{area}", &room.area)
                    .replace("{serverID}", &room.server_id)
                    .replace("{terrain}", room.terrain.as_str())
                    .replace("{note}", &room.note)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FlagMode {
    Add,
    Remove,
}

impl FlagMode {
    /// Accepts unambiguous abbreviations of `add` and `remove`.
    fn parse(word: &str) -> Option<Self> {
        if is_prefix_of(word, "add") {
            Some(Self::Add)
        } else if is_prefix_of(word, "remove") {
            Some(Self::Remove)
        } else {
            None
        }
    }
}

fn is_prefix_of(word: &str, full: &str) -> bool {
    !word.is_empty() && full.starts_with(word)
}

fn parse_mode_and_flag<T: std::str::FromStr>(text: &str) -> Option<(FlagMode, T)> {
    let mut words = text.split_whitespace();
    let mode = FlagMode::parse(words.next()?)?;
    let flag = words.next()?.parse().ok()?;
    Some((mode, flag))
}

fn join_display<T: std::fmt::Display>(set: &std::collections::BTreeSet<T>) -> String {
    set.iter().map(T::to_string).collect::<Vec<_>>().join(", ")
}

fn single_char(text: &str) -> Option<char> {
    let mut chars = text.chars();
    let first = chars.next()?;
    chars.next().is_none().then_some(first)
}

fn no_location() -> String {
    "Error! The mapper has no location. Please use the sync command then try again.".to_owned()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    for (i, &ca) in a.iter().enumerate() {
        let mut current = vec![i + 1];
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current.push(substitution.min(previous[j + 1] + 1).min(current[j] + 1));
        }
        previous = current;
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn world_with_rooms(count: u64) -> World {
        let mut world = World::new();
        for vnum in 0..count {
            let mut room = Room::new(vnum.to_string());
            room.name = format!("Room {vnum}");
            world.rooms.insert(vnum.to_string(), room);
        }
        world.current_vnum = "0".to_owned();
        world.is_synced = true;
        world
    }

    #[test]
    fn new_vnum_is_max_plus_one() {
        let world = world_with_rooms(3);
        assert_eq!(world.new_vnum(), "3");
        assert_eq!(World::new().new_vnum(), "0");
    }

    #[test]
    fn rlink_add_creates_back_link_when_reverse_is_free() {
        let mut world = world_with_rooms(2);
        let output = world.rlink("add 1 north");
        assert!(output.contains("Linked exit south in second room"), "{output}");
        assert_eq!(
            world.rooms["0"].exits[&Direction::North].to,
            ExitDestination::Room("1".to_owned())
        );
        assert_eq!(
            world.rooms["1"].exits[&Direction::South].to,
            ExitDestination::Room("0".to_owned())
        );
    }

    #[test]
    fn rlink_add_respects_existing_reverse_exit() {
        let mut world = world_with_rooms(3);
        world
            .rooms
            .get_mut("1")
            .unwrap()
            .exits
            .insert(Direction::South, Exit::new(ExitDestination::Room("2".to_owned())));
        let output = world.rlink("add 1 north");
        assert!(output.contains("exit already defined"), "{output}");
        assert_eq!(
            world.rooms["1"].exits[&Direction::South].to,
            ExitDestination::Room("2".to_owned())
        );
    }

    #[test]
    fn rlink_oneway_does_not_touch_destination() {
        let mut world = world_with_rooms(2);
        let output = world.rlink("add oneway 1 east");
        assert!(output.contains("one way"), "{output}");
        assert!(world.rooms["1"].exits.is_empty());
    }

    #[test]
    fn rdelete_rewrites_incoming_exits() {
        let mut world = world_with_rooms(3);
        world.rlink("add 2 down");
        world.current_vnum = "1".to_owned();
        world.rlink("add 2 east");
        let output = world.rdelete("2");
        assert!(output.starts_with("Deleting room '2'"), "{output}");
        assert!(!world.rooms.contains_key("2"));
        assert_eq!(
            world.rooms["0"].exits[&Direction::Down].to,
            ExitDestination::Undefined
        );
        assert_eq!(
            world.rooms["1"].exits[&Direction::East].to,
            ExitDestination::Undefined
        );
    }

    #[test]
    fn rdelete_of_current_room_desyncs() {
        let mut world = world_with_rooms(2);
        world.current_vnum = "1".to_owned();
        world.rdelete("1");
        assert!(!world.is_synced);
        assert_eq!(world.current_vnum, "0");
    }

    #[test]
    fn revnum_updates_links_and_labels() {
        let mut world = world_with_rooms(2);
        world.rlink("add 1 north");
        world.labels.insert("home".to_owned(), "1".to_owned());
        let output = world.revnum("1 50");
        assert_eq!(output, "Changed the VNum '1' to '50'.");
        assert!(world.rooms.contains_key("50"));
        assert_eq!(
            world.rooms["0"].exits[&Direction::North].to,
            ExitDestination::Room("50".to_owned())
        );
        assert_eq!(world.labels["home"], "50");
    }

    #[test]
    fn secret_add_query_remove() {
        let mut world = world_with_rooms(1);
        let output = world.secret("add gate e");
        assert_eq!(output, "Adding secret 'gate' to direction 'east'.");
        let exit = &world.rooms["0"].exits[&Direction::East];
        assert!(exit.exit_flags.contains(&ExitFlag::Door));
        assert!(exit.door_flags.contains(&DoorFlag::Hidden));
        assert_eq!(world.secret("e"), "Exit 'east' has secret 'gate'.");
        assert_eq!(world.secret("remove e"), "Secret east removed.");
        assert!(world.rooms["0"].exits[&Direction::East].door.is_empty());
    }

    #[test]
    fn flag_commands_add_and_remove() {
        let mut world = world_with_rooms(1);
        assert_eq!(world.rmobflags("add rent"), "Mob flag 'rent' added.");
        assert_eq!(world.rmobflags("add rent"), "Mob flag 'rent' already set.");
        assert_eq!(world.rmobflags("remove rent"), "Mob flag 'rent' removed.");
        world.secret("add gate north");
        assert_eq!(
            world.doorflags("add no_pick north"),
            "Door flag 'no_pick' in direction 'north' added."
        );
        assert_eq!(
            world.exitflags("add road n"),
            "Exit flag 'road' in direction 'north' added."
        );
    }

    #[test]
    fn ridable_updates_cost() {
        let mut world = world_with_rooms(1);
        world.rridable("not_ridable");
        let room = &world.rooms["0"];
        assert_eq!(room.cost, Terrain::Undefined.cost() + 5.0);
    }

    #[test]
    fn labels_resolve_and_suggest() {
        let mut world = world_with_rooms(1);
        world.labels.insert("home".to_owned(), "0".to_owned());
        assert_eq!(world.room_from_label("home"), Ok("0".to_owned()));
        assert_eq!(world.room_from_label("0"), Ok("0".to_owned()));
        let error = world.room_from_label("hom").unwrap_err();
        assert!(error.contains("Did you mean home"), "{error}");
    }

    #[test]
    fn search_is_substring_unless_exact() {
        let mut world = world_with_rooms(2);
        world.rooms.get_mut("1").unwrap().name = "The Prancing Pony".to_owned();
        let filter = RoomFilter {
            name: Some("prancing"),
            ..RoomFilter::default()
        };
        assert_eq!(world.search_rooms(&filter).len(), 1);
        let filter = RoomFilter {
            exact: true,
            name: Some("prancing"),
            ..RoomFilter::default()
        };
        assert!(world.search_rooms(&filter).is_empty());
    }

    #[test]
    fn fname_formats_results() {
        let mut world = world_with_rooms(2);
        world.rooms.get_mut("1").unwrap().name = "Market Square".to_owned();
        let output = world.fname("{vnum}, {name}, {attribute}", "market");
        assert_eq!(output, "1, Market Square, ");
    }

    #[test]
    fn getlabel_lists_labels_of_room() {
        let mut world = world_with_rooms(1);
        world.labels.insert("home".to_owned(), "0".to_owned());
        world.labels.insert("start".to_owned(), "0".to_owned());
        assert_eq!(world.getlabel(""), "Room labels: home, start");
    }
}
