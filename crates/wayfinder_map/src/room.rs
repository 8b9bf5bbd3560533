//! Rooms, exits, and the typed attribute vocabulary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The vnum of a mapper that has no location yet.
pub const NO_LOCATION: &str = "-1";

/// Dynamic contents that mark a room as worth avoiding even without the
/// explicit avoid flag.
static AVOID_CONTENTS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Some roots lie here waiting to ensnare weary travellers\.|The remains of a clump of roots lie here in a heap of rotting compost\.|A clump of roots is here, fighting|Some withered twisted roots writhe towards you\.|Black roots shift uneasily all around you\.|black tangle of roots|Massive roots shift uneasily all around you\.|rattlesnake",
    )
    .expect("avoid-contents pattern")
});

/// Defines a copyable enum with canonical string spellings, parsing, and
/// serde renames in one place.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
        )]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// The valid spellings joined for use in help output.
            pub fn joined(separator: &str) -> String {
                Self::ALL
                    .iter()
                    .map(|value| value.as_str())
                    .collect::<Vec<_>>()
                    .join(separator)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

string_enum!(
    /// The six canonical movement directions.
    Direction {
        North => "north",
        East => "east",
        South => "south",
        West => "west",
        Up => "up",
        Down => "down",
    }
);

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// The coordinate shift of one step in this direction.
    pub fn offset(self) -> (i64, i64, i64) {
        match self {
            Self::North => (0, 1, 0),
            Self::South => (0, -1, 0),
            Self::East => (1, 0, 0),
            Self::West => (-1, 0, 0),
            Self::Up => (0, 0, 1),
            Self::Down => (0, 0, -1),
        }
    }

    /// The single-letter command sent to the game.
    pub fn letter(self) -> char {
        match self {
            Self::North => 'n',
            Self::East => 'e',
            Self::South => 's',
            Self::West => 'w',
            Self::Up => 'u',
            Self::Down => 'd',
        }
    }

    /// Matches an unambiguous abbreviation such as `n` or `dow`.
    pub fn from_prefix(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        let mut found = None;
        for direction in Self::ALL {
            if direction.as_str().starts_with(text) {
                if found.is_some() {
                    return None;
                }
                found = Some(*direction);
            }
        }
        found
    }
}

string_enum!(
    /// Terrain classification, which drives the base movement cost.
    Terrain {
        Brush => "brush",
        Building => "building",
        Cavern => "cavern",
        City => "city",
        Deathtrap => "deathtrap",
        Field => "field",
        Forest => "forest",
        Hills => "hills",
        Mountains => "mountains",
        Rapids => "rapids",
        Road => "road",
        Shallows => "shallows",
        Tunnel => "tunnel",
        Undefined => "undefined",
        Underwater => "underwater",
        Water => "water",
    }
);

impl Terrain {
    pub fn cost(self) -> f64 {
        match self {
            Self::Cavern | Self::City | Self::Building | Self::Tunnel => 0.75,
            Self::Road => 0.85,
            Self::Field => 1.5,
            Self::Brush => 1.8,
            Self::Forest => 2.15,
            Self::Hills | Self::Shallows => 2.45,
            Self::Mountains => 2.8,
            Self::Undefined => 30.0,
            Self::Water => 50.0,
            Self::Rapids => 60.0,
            Self::Underwater => 100.0,
            Self::Deathtrap => 1000.0,
        }
    }

    /// The prompt glyph for this terrain, if it has one.
    pub fn from_symbol(symbol: char) -> Option<Self> {
        Some(match symbol {
            ':' => Self::Brush,
            '[' => Self::Building,
            'O' => Self::Cavern,
            '#' => Self::City,
            '.' => Self::Field,
            'f' => Self::Forest,
            '(' => Self::Hills,
            '<' => Self::Mountains,
            'W' => Self::Rapids,
            '+' => Self::Road,
            '%' => Self::Shallows,
            '=' => Self::Tunnel,
            '?' => Self::Undefined,
            'U' => Self::Underwater,
            '~' => Self::Water,
            _ => return None,
        })
    }
}

string_enum!(
    Light {
        Lit => "lit",
        Dark => "dark",
        Undefined => "undefined",
    }
);

impl Light {
    /// The prompt glyph for lighting, if recognized.
    pub fn from_symbol(symbol: char) -> Option<Self> {
        Some(match symbol {
            // Sun- or moonlight, direct or indirect.
            '*' | ')' => Self::Lit,
            'o' => Self::Dark,
            // Artificial light.
            '!' => Self::Undefined,
            _ => return None,
        })
    }
}

string_enum!(
    RoomAlign {
        Good => "good",
        Neutral => "neutral",
        Evil => "evil",
        Undefined => "undefined",
    }
);

string_enum!(
    Portable {
        Portable => "portable",
        NotPortable => "not_portable",
        Undefined => "undefined",
    }
);

string_enum!(
    Ridable {
        Ridable => "ridable",
        NotRidable => "not_ridable",
        Undefined => "undefined",
    }
);

string_enum!(
    Sundeath {
        Sundeath => "sundeath",
        NoSundeath => "no_sundeath",
        Undefined => "undefined",
    }
);

string_enum!(
    MobFlag {
        Rent => "rent",
        Shop => "shop",
        WeaponShop => "weapon_shop",
        ArmourShop => "armour_shop",
        FoodShop => "food_shop",
        PetShop => "pet_shop",
        Guild => "guild",
        ScoutGuild => "scout_guild",
        MageGuild => "mage_guild",
        ClericGuild => "cleric_guild",
        WarriorGuild => "warrior_guild",
        RangerGuild => "ranger_guild",
        AggressiveMob => "aggressive_mob",
        QuestMob => "quest_mob",
        PassiveMob => "passive_mob",
        EliteMob => "elite_mob",
        SuperMob => "super_mob",
        Milkable => "milkable",
        Rattlesnake => "rattlesnake",
    }
);

string_enum!(
    LoadFlag {
        Treasure => "treasure",
        Armour => "armour",
        Weapon => "weapon",
        Water => "water",
        Food => "food",
        Herb => "herb",
        Key => "key",
        Mule => "mule",
        Horse => "horse",
        PackHorse => "pack_horse",
        TrainedHorse => "trained_horse",
        Rohirrim => "rohirrim",
        Warg => "warg",
        Boat => "boat",
        Attention => "attention",
        // Player can watch surrounding rooms from this one.
        Tower => "tower",
        Clock => "clock",
        Mail => "mail",
        Stable => "stable",
        WhiteWord => "white_word",
        DarkWord => "dark_word",
        Equipment => "equipment",
        Coach => "coach",
        Ferry => "ferry",
    }
);

string_enum!(
    ExitFlag {
        Avoid => "avoid",
        Exit => "exit",
        Door => "door",
        Road => "road",
        Climb => "climb",
        Random => "random",
        Special => "special",
        NoMatch => "no_match",
        Flow => "flow",
        NoFlee => "no_flee",
        Damage => "damage",
        Fall => "fall",
        Guarded => "guarded",
    }
);

string_enum!(
    DoorFlag {
        Hidden => "hidden",
        NeedKey => "need_key",
        NoBlock => "no_block",
        NoBreak => "no_break",
        NoPick => "no_pick",
        Delayed => "delayed",
        Callable => "callable",
        Knockable => "knockable",
        Magic => "magic",
        // Action controlled.
        Action => "action",
        NoBash => "no_bash",
    }
);

/// Where an exit leads.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum ExitDestination {
    /// The exit is known to exist but its destination is not mapped.
    #[default]
    Undefined,
    /// Walking through kills the character.
    Death,
    Room(String),
}

impl ExitDestination {
    pub fn from_text(text: &str) -> Self {
        match text {
            "undefined" => Self::Undefined,
            "death" => Self::Death,
            vnum => Self::Room(vnum.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Undefined => "undefined",
            Self::Death => "death",
            Self::Room(vnum) => vnum,
        }
    }

    /// The destination vnum, when it names one.
    pub fn vnum(&self) -> Option<&str> {
        match self {
            Self::Room(vnum) => Some(vnum),
            _ => None,
        }
    }
}

impl fmt::Display for ExitDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExitDestination {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExitDestination {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::from_text(&text))
    }
}

/// One directed edge of the room graph.
#[derive(Clone, PartialEq, Debug)]
pub struct Exit {
    pub to: ExitDestination,
    /// Always contains [`ExitFlag::Exit`].
    pub exit_flags: BTreeSet<ExitFlag>,
    /// The door name, empty when there is none.
    pub door: String,
    pub door_flags: BTreeSet<DoorFlag>,
}

impl Exit {
    pub fn new(to: ExitDestination) -> Self {
        Self {
            to,
            exit_flags: BTreeSet::from([ExitFlag::Exit]),
            door: String::new(),
            door_flags: BTreeSet::new(),
        }
    }

    pub fn has_flag(&self, flag: ExitFlag) -> bool {
        self.exit_flags.contains(&flag)
    }
}

impl Default for Exit {
    fn default() -> Self {
        Self::new(ExitDestination::Undefined)
    }
}

/// One room of the map.
#[derive(Clone, Debug)]
pub struct Room {
    pub vnum: String,
    /// Opaque identifier supplied by the game; `"0"` when unknown.
    pub server_id: String,
    pub area: String,
    pub name: String,
    pub desc: String,
    pub dynamic_desc: String,
    pub note: String,
    pub terrain: Terrain,
    pub light: Light,
    pub align: RoomAlign,
    pub portable: Portable,
    pub ridable: Ridable,
    pub sundeath: Sundeath,
    pub avoid: bool,
    pub mob_flags: BTreeSet<MobFlag>,
    pub load_flags: BTreeSet<LoadFlag>,
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub exits: BTreeMap<Direction, Exit>,
    /// Derived movement cost; kept in sync by [`Room::calculate_cost`].
    pub cost: f64,
}

impl Room {
    pub fn new(vnum: impl Into<String>) -> Self {
        Self {
            vnum: vnum.into(),
            server_id: "0".to_owned(),
            area: String::new(),
            name: String::new(),
            desc: String::new(),
            dynamic_desc: String::new(),
            note: String::new(),
            terrain: Terrain::Undefined,
            light: Light::Undefined,
            align: RoomAlign::Undefined,
            portable: Portable::Undefined,
            ridable: Ridable::Undefined,
            sundeath: Sundeath::Undefined,
            avoid: false,
            mob_flags: BTreeSet::new(),
            load_flags: BTreeSet::new(),
            x: 0,
            y: 0,
            z: 0,
            exits: BTreeMap::new(),
            cost: Terrain::Undefined.cost(),
        }
    }

    /// Recomputes the movement cost from terrain, the avoid flag, the
    /// avoid-contents pattern, and ridability.
    pub fn calculate_cost(&mut self) {
        self.cost = self.terrain.cost();
        if self.avoid || AVOID_CONTENTS_REGEX.is_match(&self.dynamic_desc) {
            self.cost += 1000.0;
        }
        if self.ridable == Ridable::NotRidable {
            self.cost += 5.0;
        }
    }

    pub fn coordinates(&self) -> (i64, i64, i64) {
        (self.x, self.y, self.z)
    }

    pub fn set_coordinates(&mut self, coordinates: (i64, i64, i64)) {
        (self.x, self.y, self.z) = coordinates;
    }

    pub fn manhattan_distance(&self, other: &Room) -> i64 {
        (other.x - self.x).abs() + (other.y - self.y).abs() + (other.z - self.z).abs()
    }

    /// The other room's bearing from this one as a clock position.
    pub fn clock_position_to(&self, other: &Room) -> String {
        if self.vnum == other.vnum {
            return "here".to_owned();
        }
        let (dx, dy) = ((other.x - self.x) as f64, (other.y - self.y) as f64);
        if dx == 0.0 && dy == 0.0 {
            return "same X-Y".to_owned();
        }
        let angle = dy.atan2(dx).to_degrees();
        let position = (((90.0 - angle + 360.0) % 360.0) / 30.0).round() as i64;
        let position = if position == 0 { 12 } else { position };
        format!("{position} o'clock")
    }

    /// The other room's bearing from this one as a compass point.
    pub fn direction_to(&self, other: &Room) -> String {
        const COMPASS: [&str; 8] = [
            "north",
            "northeast",
            "east",
            "southeast",
            "south",
            "southwest",
            "west",
            "northwest",
        ];
        if self.vnum == other.vnum {
            return "here".to_owned();
        }
        let (dx, dy) = ((other.x - self.x) as f64, (other.y - self.y) as f64);
        if dx == 0.0 && dy == 0.0 {
            return "same X-Y".to_owned();
        }
        let angle = dy.atan2(dx).to_degrees();
        let octant = ((((90.0 - angle + 360.0) % 360.0) / 45.0).round() as usize) % 8;
        COMPASS[octant].to_owned()
    }

    /// True when the room has no exits leading anywhere known.
    pub fn is_orphan(&self) -> bool {
        self.exits
            .values()
            .all(|exit| exit.to == ExitDestination::Undefined)
    }

    pub fn has_undefined_exits(&self) -> bool {
        self.exits
            .values()
            .any(|exit| exit.to == ExitDestination::Undefined)
    }

    /// The full attribute sheet shown by the `rinfo` command.
    pub fn info(&self) -> String {
        let mut lines = vec![
            format!("vnum: '{}'", self.vnum),
            format!("Name: '{}'", self.name),
            format!("Server ID: '{}'", self.server_id),
            "Description:".to_owned(),
            "-----".to_owned(),
        ];
        lines.extend(self.desc.lines().map(str::to_owned));
        lines.push("-----".to_owned());
        lines.push("Dynamic Desc:".to_owned());
        lines.push("-----".to_owned());
        lines.extend(self.dynamic_desc.lines().map(str::to_owned));
        lines.push("-----".to_owned());
        lines.push(format!("Note: '{}'", self.note));
        lines.push(format!("Area: '{}'", self.area));
        lines.push(format!("Terrain: '{}'", self.terrain));
        lines.push(format!("Cost: '{}'", self.cost));
        lines.push(format!("Light: '{}'", self.light));
        lines.push(format!("Align: '{}'", self.align));
        lines.push(format!("Portable: '{}'", self.portable));
        lines.push(format!("Ridable: '{}'", self.ridable));
        lines.push(format!("Sundeath: '{}'", self.sundeath));
        lines.push(format!("Mob Flags: '{}'", joined_flags(&self.mob_flags)));
        lines.push(format!("Load Flags: '{}'", joined_flags(&self.load_flags)));
        lines.push(format!(
            "Coordinates (X, Y, Z): '{:?}'",
            self.coordinates()
        ));
        lines.push("Exits:".to_owned());
        for (direction, exit) in &self.exits {
            lines.push("-----".to_owned());
            lines.push(format!("Direction: '{direction}'"));
            lines.push(format!("To: '{}'", exit.to));
            lines.push(format!(
                "Exit Flags: '{}'",
                joined_flags(&exit.exit_flags)
            ));
            lines.push(format!("Door Name: '{}'", exit.door));
            lines.push(format!(
                "Door Flags: '{}'",
                joined_flags(&exit.door_flags)
            ));
        }
        lines.join("\n")
    }
}

fn joined_flags<T: fmt::Display>(flags: &BTreeSet<T>) -> String {
    flags
        .iter()
        .map(T::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trips() {
        for direction in Direction::ALL {
            assert_eq!(direction.as_str().parse::<Direction>(), Ok(*direction));
            assert_eq!(direction.reverse().reverse(), *direction);
        }
        assert_eq!(Direction::from_prefix("n"), Some(Direction::North));
        assert_eq!(Direction::from_prefix("dow"), Some(Direction::Down));
        // No unique match.
        assert_eq!(Direction::from_prefix(""), None);
    }

    #[test]
    fn offsets_cancel_in_reverse() {
        for direction in Direction::ALL {
            let (x, y, z) = direction.offset();
            let (rx, ry, rz) = direction.reverse().offset();
            assert_eq!((x + rx, y + ry, z + rz), (0, 0, 0));
        }
    }

    #[test]
    fn cost_tracks_terrain_avoid_and_ridability() {
        let mut room = Room::new("1");
        room.terrain = Terrain::City;
        room.calculate_cost();
        assert_eq!(room.cost, 0.75);
        room.avoid = true;
        room.calculate_cost();
        assert_eq!(room.cost, 1000.75);
        room.avoid = false;
        room.ridable = Ridable::NotRidable;
        room.calculate_cost();
        assert_eq!(room.cost, 5.75);
    }

    #[test]
    fn avoidable_contents_penalize_cost() {
        let mut room = Room::new("1");
        room.terrain = Terrain::Road;
        room.dynamic_desc = "Some withered twisted roots writhe towards you.\n".to_owned();
        room.calculate_cost();
        assert_eq!(room.cost, 1000.85);
    }

    #[test]
    fn new_exit_always_carries_exit_flag() {
        let exit = Exit::default();
        assert!(exit.has_flag(ExitFlag::Exit));
        assert_eq!(exit.to, ExitDestination::Undefined);
    }

    #[test]
    fn bearings() {
        let mut origin = Room::new("a");
        origin.set_coordinates((0, 0, 0));
        let mut east = Room::new("b");
        east.set_coordinates((3, 0, 0));
        assert_eq!(origin.direction_to(&east), "east");
        assert_eq!(origin.clock_position_to(&east), "3 o'clock");
        let mut north = Room::new("c");
        north.set_coordinates((0, 5, 0));
        assert_eq!(origin.direction_to(&north), "north");
        assert_eq!(origin.clock_position_to(&north), "12 o'clock");
        let mut above = Room::new("d");
        above.set_coordinates((0, 0, 1));
        assert_eq!(origin.direction_to(&above), "same X-Y");
        assert_eq!(origin.manhattan_distance(&above), 1);
    }

    #[test]
    fn destination_serialization_is_plain_text() {
        let json = serde_json::to_string(&ExitDestination::Room("42".to_owned())).unwrap();
        assert_eq!(json, "\"42\"");
        let parsed: ExitDestination = serde_json::from_str("\"death\"").unwrap();
        assert_eq!(parsed, ExitDestination::Death);
    }
}
