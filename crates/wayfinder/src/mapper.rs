//! The mapper: the single consumer of the session's event queue.
//!
//! All map mutation happens on this one consumer, so sync, auto-mapping,
//! and walking are naturally serialized. Events arrive in the exact order
//! the game's bytes were parsed; user input shares the same queue and
//! therefore the same total order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, error};
use wayfinder_map::pathfind::{self, avoid_terrains_from_flags};
use wayfinder_map::room::{Direction, Exit, ExitDestination, ExitFlag, Light, Ridable, Terrain, NO_LOCATION};
use wayfinder_map::world::{RoomFilter, World};
use wayfinder_protocol::{escape_entities, OutputFormat};

use crate::clock::Clock;
use crate::config::Config;
use crate::{cleanmap, emulation};

/// One chunk for a socket writer task.
pub enum WriteMessage {
    /// Application bytes; IAC-escaped and line-normalized before the wire.
    /// `prompt` appends the configured prompt terminator.
    Data { bytes: Vec<u8>, prompt: bool },
    /// Pre-encoded wire bytes, written verbatim.
    Raw(Vec<u8>),
}

/// An element of the mapper's event queue. Closing the queue's senders is
/// the graceful shutdown signal.
pub enum MapperEvent {
    UserInput(String),
    Mud { name: String, text: String },
}

static EXIT_TAGS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<door>[\(\[#]?)(?P<road>[=-]?)(?P<climb>[/\\]?)(?P<portal>\{?)(?P<direction>north|east|south|west|up|down)",
    )
    .expect("exit tags pattern")
});

/// Leading prompt glyphs: light, terrain, up to two weather marks, then
/// movement flags.
static PROMPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<light>[@*!\)o]?)(?P<terrain>[#\(\[\+\.%fO~UW:=<]?)(?P<weather>[*'"~=-]{0,2})\s*(?P<movement_flags>[RrSsCcW]{0,4})[^>]*>$"#,
    )
    .expect("prompt pattern")
});

static ANSI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern"));

/// Server phrases that moved the character without a movement tag.
static MOVEMENT_FORCED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"You feel confused and move along randomly\.\.\.|Suddenly an explosion of ancient rhymes makes the space collapse around you!|The pain stops, your vision clears, and you realize that you are elsewhere\.|A guard leads you out of the house\.|You leave the ferry\.|You reached the riverbank\.|You stop moving towards the (?:left|right) bank and drift downstream\.|You are borne along by a strong current\.|You are swept away by the current\.|You are swept away by the powerful current of water\.|You board the ferry\.|You are dead! Sorry\.\.\.|With a jerk, the basket starts gliding down the rope towards the platform\.|The current pulls you faster\. Suddenly, you are sucked downwards into darkness!|You are washed blindly over the rocks, and plummet sickeningly downwards\.\.\.|Oops! You walk off the bridge and fall into the rushing water below!|Holding your breath and with closed eyes, you are squeezed below the surface of the water\.|You tighten your grip as (?:a Great Eagle|Gwaihir the Windlord) starts to descend fast\.|The trees confuse you, making you wander around in circles\.|Sarion helps you outside\.|You cannot control your mount on the slanted and unstable surface!(?: You begin to slide to the north, and plunge toward the water below!)?|Stepping on the lizard corpses, you use some depressions in the wall for support, push the muddy ceiling apart and climb out of the cave\.",
    )
    .expect("forced movement pattern")
});

/// Server phrases that refused a movement attempt.
static MOVEMENT_PREVENTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:The \w+ seems? to be closed\.|It seems to be locked\.|You cannot ride there\.|Your boat cannot enter this place\.|A guard steps in front of you\.|The clerk bars your way\.|You cannot go that way\.\.\.|Alas, you cannot go that way\.\.\.|You need to swim to go there\.|You failed swimming there\.|You failed to climb there and fall down, hurting yourself\.|Your mount cannot climb the tree!|No way! You are fighting for your life!|In your dreams, or what\?|You are too exhausted\.|You unsuccessfully try to break through the ice\.|Your mount refuses to follow your orders!|You are too exhausted to ride\.|You can(?:not ride|'t go) into deep water!|You don't control your mount!|Your mount is too sensible to attempt such a feat\.|Oops! You cannot go there riding!|You'd better be swimming if you want to dive underwater\.|You need to climb to go there\.|You cannot climb there\.|If you still want to try, you must 'climb' there\.|Nah\.\.\. You feel too relaxed to do that\.|Maybe you should get on your feet first\?|Not from your present position!|.+ (?:prevents|keeps) you from going (?:north|south|east|west|up|down|upstairs|downstairs|past (?:him|her|it))\.|A (?:pony|dales-pony|horse|warhorse|pack horse|trained horse|horse of the Rohirrim|brown donkey|mountain mule|hungry warg|brown wolf)(?: \(\w+\))? (?:is too exhausted|doesn't want you riding (?:him|her|it) anymore)\.)$",
    )
    .expect("prevented movement pattern")
});

/// Removes ANSI colour sequences before an event reaches any handler.
pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").into_owned()
}

/// Collapses runs of whitespace, the form room names and descriptions are
/// matched in.
pub fn simplified(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct MapperOptions {
    pub output_format: OutputFormat,
    pub find_format: String,
    pub gag_prompts: bool,
    pub is_emulating_offline: bool,
    pub data_dir: PathBuf,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Normal,
            find_format: "{vnum}, {name}, {attribute}".to_owned(),
            gag_prompts: false,
            is_emulating_offline: false,
            data_dir: PathBuf::from("."),
        }
    }
}

pub(crate) type HandlerFn = fn(&mut Mapper, &str);

/// Mud event dispatch table. Several handlers may subscribe to one event
/// name; the exits event feeds both the sync engine and the hidden-exit
/// cleaner.
const MUD_EVENT_HANDLERS: &[(&str, HandlerFn)] = &[
    ("prompt", Mapper::mud_event_prompt),
    ("movement", Mapper::mud_event_movement),
    ("line", Mapper::mud_event_line),
    ("name", Mapper::mud_event_name),
    ("description", Mapper::mud_event_description),
    ("terrain", Mapper::mud_event_terrain),
    ("dynamic", Mapper::mud_event_dynamic),
    ("exits", Mapper::mud_event_exits),
    ("exits", cleanmap::clean_hidden_exits),
    ("room", Mapper::mud_event_room),
];

const USER_COMMANDS: &[(&str, HandlerFn)] = &[
    ("automap", Mapper::user_command_automap),
    ("autolink", Mapper::user_command_autolink),
    ("automerge", Mapper::user_command_automerge),
    ("autoupdate", Mapper::user_command_autoupdate),
    ("clock", Mapper::user_command_clock),
    ("doorflags", Mapper::user_command_doorflags),
    ("emu", Mapper::user_command_emu),
    ("exitflags", Mapper::user_command_exitflags),
    ("farea", Mapper::user_command_farea),
    ("fdoor", Mapper::user_command_fdoor),
    ("fdynamic", Mapper::user_command_fdynamic),
    ("flabel", Mapper::user_command_flabel),
    ("fname", Mapper::user_command_fname),
    ("fnote", Mapper::user_command_fnote),
    ("fsid", Mapper::user_command_fsid),
    ("getlabel", Mapper::user_command_getlabel),
    ("maphelp", Mapper::user_command_maphelp),
    ("path", Mapper::user_command_path),
    ("ralign", Mapper::user_command_ralign),
    ("ravoid", Mapper::user_command_ravoid),
    ("rdelete", Mapper::user_command_rdelete),
    ("revnum", Mapper::user_command_revnum),
    ("rinfo", Mapper::user_command_rinfo),
    ("rlabel", Mapper::user_command_rlabel),
    ("rlight", Mapper::user_command_rlight),
    ("rlink", Mapper::user_command_rlink),
    ("rloadflags", Mapper::user_command_rloadflags),
    ("rmobflags", Mapper::user_command_rmobflags),
    ("rnote", Mapper::user_command_rnote),
    ("rportable", Mapper::user_command_rportable),
    ("rridable", Mapper::user_command_rridable),
    ("rsundeath", Mapper::user_command_rsundeath),
    ("rterrain", Mapper::user_command_rterrain),
    ("run", Mapper::user_command_run),
    ("rx", Mapper::user_command_rx),
    ("ry", Mapper::user_command_ry),
    ("rz", Mapper::user_command_rz),
    ("savemap", Mapper::user_command_savemap),
    ("secret", Mapper::user_command_secret),
    ("secretaction", Mapper::user_command_secretaction),
    ("step", Mapper::user_command_step),
    ("stop", Mapper::user_command_stop),
    ("sync", Mapper::user_command_sync),
    ("tvnum", Mapper::user_command_tvnum),
    ("vnum", Mapper::user_command_vnum),
];

/// The first-word byte strings the proxy diverts to the mapper instead of
/// forwarding to the game.
pub fn mapper_command_names() -> Vec<Vec<u8>> {
    USER_COMMANDS
        .iter()
        .map(|(name, _)| name.as_bytes().to_vec())
        .collect()
}

pub(crate) fn find_user_command(name: &str) -> Option<HandlerFn> {
    USER_COMMANDS
        .iter()
        .find(|(command, _)| *command == name)
        .map(|(_, handler)| *handler)
}

pub struct Mapper {
    pub world: Arc<RwLock<World>>,
    pub config: Config,
    pub data_dir: PathBuf,
    output_format: OutputFormat,
    find_format: String,
    gag_prompts: bool,
    pub is_emulating_offline: bool,
    player_tx: flume::Sender<WriteMessage>,
    game_tx: flume::Sender<WriteMessage>,

    pub auto_mapping: bool,
    pub auto_merging: bool,
    pub auto_linking: bool,
    pub(crate) auto_update_rooms: bool,

    pub auto_walk: bool,
    pub auto_walk_directions: Vec<String>,
    last_path_find_query: String,

    // State of the current turn, reset at each prompt.
    pub prompt: String,
    pub scouting: bool,
    pub movement: Option<String>,
    pub moved: Option<Direction>,
    pub room_name: Option<String>,
    pub description: Option<String>,
    pub dynamic: Option<String>,
    pub exits_line: Option<String>,
    pub xml_room_attrs: HashMap<String, String>,
    added_new_room_from: Option<String>,
    should_notify_not_synced: bool,

    // Emulation state; the emulated location is decoupled from the real one.
    pub emulation_vnum: String,
    pub last_emulated_jump: Option<String>,
    pub emulating_brief_mode: bool,
    pub emulating_dynamic_descs: bool,

    clock: Clock,
    unknown_events: HashSet<String>,
}

impl Mapper {
    pub fn new(
        world: Arc<RwLock<World>>,
        config: Config,
        options: MapperOptions,
        player_tx: flume::Sender<WriteMessage>,
        game_tx: flume::Sender<WriteMessage>,
    ) -> Self {
        let auto_update_rooms = config.auto_update_rooms();
        let emulation_vnum = world.read().current_vnum.clone();
        Self {
            world,
            config,
            data_dir: options.data_dir,
            output_format: options.output_format,
            find_format: options.find_format,
            gag_prompts: options.gag_prompts,
            is_emulating_offline: options.is_emulating_offline,
            player_tx,
            game_tx,
            auto_mapping: false,
            auto_merging: true,
            auto_linking: true,
            auto_update_rooms,
            auto_walk: false,
            auto_walk_directions: Vec::new(),
            last_path_find_query: String::new(),
            prompt: String::new(),
            scouting: false,
            movement: None,
            moved: None,
            room_name: None,
            description: None,
            dynamic: None,
            exits_line: None,
            xml_room_attrs: HashMap::new(),
            added_new_room_from: None,
            should_notify_not_synced: true,
            emulation_vnum,
            last_emulated_jump: None,
            emulating_brief_mode: true,
            emulating_dynamic_descs: true,
            clock: Clock::new(),
            unknown_events: HashSet::new(),
        }
    }

    /// Consumes the event queue until every sender is gone.
    pub fn run(&mut self, events: &flume::Receiver<MapperEvent>) {
        for event in events.iter() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match event {
                    MapperEvent::UserInput(line) => self.handle_user_input(&line),
                    MapperEvent::Mud { name, text } => self.dispatch_mud_event(&name, &text),
                }
            }));
            if outcome.is_err() {
                error!("error in mapper thread; continuing");
                self.send_player("Error in mapper thread.");
            }
        }
        self.send_player("Exiting mapper thread.");
    }

    pub fn dispatch_mud_event(&mut self, name: &str, text: &str) {
        let text = strip_ansi(text);
        // While scouting, only turn boundaries and movement get through.
        if self.scouting && !matches!(name, "prompt" | "movement") {
            return;
        }
        let mut handled = false;
        for (event, handler) in MUD_EVENT_HANDLERS {
            if *event == name {
                handler(self, &text);
                handled = true;
            }
        }
        if !handled && self.unknown_events.insert(name.to_owned()) {
            debug!(event = name, "received data with an unknown event type");
        }
    }

    pub fn handle_user_input(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.is_emulating_offline {
            emulation::user_command_emu(self, text);
            return;
        }
        let (command, args) = match text.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (text, ""),
        };
        match USER_COMMANDS
            .iter()
            .find(|(name, _)| *name == command)
        {
            Some((_, handler)) => handler(self, args),
            None => debug!(command, "unknown mapper command reached the mapper"),
        }
    }

    // --- output -----------------------------------------------------------

    pub fn send_player(&self, msg: &str) {
        self.send_player_with(msg, true);
    }

    pub fn send_player_with(&self, msg: &str, show_prompt: bool) {
        let show = show_prompt && !self.prompt.is_empty() && !self.gag_prompts;
        let (bytes, prompt) = match self.output_format {
            OutputFormat::Raw => {
                let escaped = String::from_utf8_lossy(&escape_entities(msg.as_bytes())).into_owned();
                if show {
                    let prompt =
                        String::from_utf8_lossy(&escape_entities(self.prompt.as_bytes()))
                            .into_owned();
                    (format!("{escaped}\n<prompt>{prompt}</prompt>"), true)
                } else {
                    (format!("\n{escaped}\n"), false)
                }
            }
            OutputFormat::Tintin => {
                if show {
                    (format!("{msg}\nPROMPT:{}:PROMPT", self.prompt), true)
                } else {
                    (format!("\n{msg}\n"), false)
                }
            }
            OutputFormat::Normal => {
                if show {
                    (format!("{msg}\n{}", self.prompt), true)
                } else {
                    (format!("\n{msg}\n"), false)
                }
            }
        };
        let _ = self.player_tx.send(WriteMessage::Data {
            bytes: bytes.into_bytes(),
            prompt,
        });
    }

    pub fn send_game(&self, msg: &str) {
        let _ = self.game_tx.send(WriteMessage::Data {
            bytes: format!("{msg}\n").into_bytes(),
            prompt: false,
        });
    }

    // --- mud event handlers -----------------------------------------------

    fn mud_event_prompt(&mut self, text: &str) {
        self.prompt = text.to_owned();
        let synced = self.world.read().is_synced;
        if synced {
            if self.auto_mapping && self.moved.is_some() {
                self.update_room_flags_from_prompt();
            }
        } else if self.room_name.as_deref().is_some_and(|name| !name.is_empty()) {
            self.sync();
        }
        if self.world.read().is_synced && self.dynamic.is_some() {
            self.room_details();
            if !self.auto_walk_directions.is_empty() && self.moved.is_some() && self.auto_walk {
                self.walk_next_direction();
            }
        }
        self.added_new_room_from = None;
        self.scouting = false;
        self.movement = None;
        self.moved = None;
        self.room_name = None;
        self.description = None;
        self.dynamic = None;
        self.exits_line = None;
    }

    fn mud_event_movement(&mut self, text: &str) {
        self.movement = Some(text.to_owned());
        self.scouting = false;
    }

    fn mud_event_room(&mut self, text: &str) {
        self.xml_room_attrs = wayfinder_protocol::xml::parse_tag_attributes(text.as_bytes());
    }

    fn mud_event_name(&mut self, text: &str) {
        // These two names mean the room could not be seen at all.
        if matches!(
            text,
            "You just see a dense fog around you..." | "It is pitch black..."
        ) {
            self.room_name = Some(String::new());
        } else {
            self.room_name = Some(simplified(text));
        }
    }

    fn mud_event_description(&mut self, text: &str) {
        self.description = Some(simplified(text));
    }

    fn mud_event_terrain(&mut self, _text: &str) {
        // Terrain arrives through the room tag's attributes; the element
        // itself carries only the display glyph.
    }

    fn mud_event_exits(&mut self, text: &str) {
        self.exits_line = Some(text.to_owned());
    }

    fn mud_event_line(&mut self, text: &str) {
        if text.starts_with("You quietly scout ") {
            self.scouting = true;
            return;
        }
        if text == "A huge clock is standing here." {
            self.send_game("look at clock");
        } else if text
            == "Wet, cold and filled with mud you drop down into a dark and moist cave, while \
                you notice the mud above you moving to close the hole you left in the cave \
                ceiling."
        {
            self.sync_to("17189");
        } else if text
            == "The gravel below your feet loosens, shifting slightly.. Suddenly, you lose your \
                balance and crash to the cave floor below."
        {
            self.sync_to("15324");
        }
        if MOVEMENT_FORCED_REGEX.is_match(text) || MOVEMENT_PREVENTED_REGEX.is_match(text) {
            self.stop_run();
        }
        if self.world.read().is_synced && self.auto_mapping {
            let ridable = self.world.read().current().map(|room| room.ridable);
            if text == "It's too difficult to ride here." && ridable != Some(Ridable::NotRidable) {
                let output = self.world.write().rridable("not_ridable");
                self.send_player(&output);
            } else if text == "You are already riding." && ridable != Some(Ridable::Ridable) {
                let output = self.world.write().rridable("ridable");
                self.send_player(&output);
            }
        }
    }

    fn mud_event_dynamic(&mut self, text: &str) {
        self.dynamic = Some(text.trim_start().to_owned());
        self.moved = None;
        self.added_new_room_from = None;
        let synced = self.world.read().is_synced;
        if synced && self.movement.is_some() {
            let movement = self.movement.clone().unwrap_or_default();
            if self.validate_movement(&movement) {
                let direction: Direction = movement.parse().expect("validated above");
                if self.auto_mapping && !self.exit_leads_to_known_room(direction) {
                    self.map_unknown_movement(direction);
                }
                self.follow_exit(direction);
            }
        }
        if self.auto_mapping && self.world.read().is_synced {
            if let (Some(moved), Some(exits_text)) = (self.moved, self.exits_line.clone()) {
                if let Some(origin) = self.added_new_room_from.clone() {
                    // The arrival listing shows the way back; link it.
                    if exits_text.contains(moved.reverse().as_str()) {
                        let mut world = self.world.write();
                        if let Some(room) = world.current_mut() {
                            room.exits.insert(
                                moved.reverse(),
                                Exit::new(ExitDestination::Room(origin)),
                            );
                        }
                    }
                }
                self.update_exit_flags(&exits_text);
            }
        }
        self.exits_line = None;
    }

    /// Checks that a reported movement can be followed on the map. Returns
    /// false after desyncing with a diagnostic.
    fn validate_movement(&mut self, movement: &str) -> bool {
        let direction = movement.parse::<Direction>();
        let diagnostic = if movement.is_empty() {
            "Forced movement, no longer synced.".to_owned()
        } else if direction.is_err() {
            format!("Error: Invalid direction '{movement}'. Map no longer synced!")
        } else {
            let direction = direction.expect("checked above");
            let world = self.world.read();
            let exit_destination = world
                .current()
                .and_then(|room| room.exits.get(&direction))
                .map(|exit| exit.to.clone());
            match exit_destination {
                None if !self.auto_mapping => {
                    format!("Error: direction '{movement}' not in database. Map no longer synced!")
                }
                Some(to)
                    if !self.auto_mapping
                        && to.vnum().is_none_or(|vnum| !world.rooms.contains_key(vnum)) =>
                {
                    format!(
                        "Error: vnum ({to}) in direction ({movement}) is not in the database. \
                         Map no longer synced!"
                    )
                }
                _ => return true,
            }
        };
        self.send_player(&diagnostic);
        self.world.write().is_synced = false;
        false
    }

    fn exit_leads_to_known_room(&self, direction: Direction) -> bool {
        let world = self.world.read();
        world
            .current()
            .and_then(|room| room.exits.get(&direction))
            .and_then(|exit| exit.to.vnum())
            .is_some_and(|vnum| world.rooms.contains_key(vnum))
    }

    /// Auto-mapping for a movement the map cannot follow: merge into an
    /// identical existing room, or create a fresh one.
    fn map_unknown_movement(&mut self, direction: Direction) {
        let room_name = self.room_name.clone().unwrap_or_default();
        let description = self.description.clone().unwrap_or_default();
        let dynamic = self.dynamic.clone().unwrap_or_default();
        if room_name.is_empty() {
            self.send_player("Unable to add new room: empty room name.");
            return;
        }
        if description.is_empty() {
            self.send_player("Unable to add new room: empty room description.");
            return;
        }
        let duplicate = if self.auto_merging {
            let world = self.world.read();
            let matches = world.search_rooms(&RoomFilter {
                exact: true,
                name: Some(&room_name),
                desc: Some(&description),
                ..RoomFilter::default()
            });
            match matches.as_slice() {
                [only] => Some(only.vnum.clone()),
                _ => None,
            }
        } else {
            None
        };
        match duplicate {
            Some(vnum) => self.auto_merge_room(direction, &vnum),
            None => {
                self.added_new_room_from = Some(self.world.read().current_vnum.clone());
                self.add_new_room(direction, &room_name, &description, &dynamic);
            }
        }
    }

    fn auto_merge_room(&mut self, direction: Direction, vnum: &str) {
        let mut output = Vec::new();
        let back_is_free = {
            let world = self.world.read();
            world.rooms.get(vnum).is_some_and(|room| {
                room.exits
                    .get(&direction.reverse())
                    .is_some_and(|exit| exit.to == ExitDestination::Undefined)
            })
        };
        let link_command = if self.auto_linking && back_is_free {
            format!("add {vnum} {direction}")
        } else {
            format!("add oneway {vnum} {direction}")
        };
        output.push(self.world.write().rlink(&link_command));
        let name = self
            .world
            .read()
            .rooms
            .get(vnum)
            .map(|room| room.name.clone())
            .unwrap_or_default();
        output.push(format!("Auto Merging '{vnum}' with name '{name}'."));
        self.send_player(&output.join("\n"));
    }

    fn add_new_room(&mut self, direction: Direction, name: &str, description: &str, dynamic: &str) {
        let mut world = self.world.write();
        let vnum = world.new_vnum();
        let coordinates = world
            .current()
            .map(|room| World::coordinates_add_direction(room.coordinates(), direction))
            .unwrap_or_default();
        let mut room = wayfinder_map::Room::new(vnum.as_str());
        room.name = name.to_owned();
        room.desc = description.to_owned();
        room.dynamic_desc = dynamic.to_owned();
        room.set_coordinates(coordinates);
        room.calculate_cost();
        world.rooms.insert(vnum.clone(), room);
        if let Some(current) = world.current_mut() {
            current
                .exits
                .entry(direction)
                .or_default()
                .to = ExitDestination::Room(vnum.clone());
        }
        let message = format!("Adding room '{name}' with vnum '{vnum}'");
        drop(world);
        self.send_player(&message);
    }

    /// Moves the current room along a validated exit.
    fn follow_exit(&mut self, direction: Direction) {
        let destination = {
            let world = self.world.read();
            world
                .current()
                .and_then(|room| room.exits.get(&direction))
                .and_then(|exit| exit.to.vnum().map(str::to_owned))
                .filter(|vnum| world.rooms.contains_key(vnum))
        };
        match destination {
            Some(vnum) => {
                self.world.write().current_vnum = vnum;
                self.moved = Some(direction);
                self.movement = None;
                if self.auto_mapping && self.auto_update_rooms {
                    self.update_rooms();
                }
            }
            None => {
                self.world.write().is_synced = false;
                self.send_player(&format!(
                    "Error: direction '{direction}' leads nowhere mapped. Map no longer synced!"
                ));
            }
        }
    }

    /// Rewrites the current room from the turn state when auto-updating.
    fn update_rooms(&mut self) {
        let mut output = Vec::new();
        {
            let mut world = self.world.write();
            let Some(room) = world.current_mut() else {
                return;
            };
            if let Some(name) = self.room_name.as_deref() {
                if !name.is_empty() && room.name != name {
                    room.name = name.to_owned();
                    output.push("Updating room name.".to_owned());
                }
            }
            if let Some(desc) = self.description.as_deref() {
                if !desc.is_empty() && room.desc != desc {
                    room.desc = desc.to_owned();
                    output.push("Updating room description.".to_owned());
                }
            }
            if let Some(dynamic) = self.dynamic.as_deref() {
                if !dynamic.is_empty() && room.dynamic_desc != dynamic {
                    room.dynamic_desc = dynamic.to_owned();
                    room.calculate_cost();
                    output.push("Updating room dynamic description.".to_owned());
                }
            }
            if let Some(area) = self.xml_room_attrs.get("area") {
                if room.area != *area {
                    room.area = area.clone();
                    output.push(format!("Setting room area to '{area}'."));
                }
            }
            if let Some(server_id) = self.xml_room_attrs.get("id") {
                if server_id.chars().all(|c| c.is_ascii_digit())
                    && !server_id.is_empty()
                    && room.server_id != *server_id
                {
                    room.server_id = server_id.clone();
                    output.push(format!("Setting room server ID to '{server_id}'."));
                }
            }
        }
        if let Some(terrain) = self.xml_room_attrs.get("terrain").cloned() {
            let differs = self
                .world
                .read()
                .current()
                .is_some_and(|room| room.terrain.as_str() != terrain);
            if differs {
                output.push(self.world.write().rterrain(&terrain));
            }
        }
        if !output.is_empty() {
            self.send_player(&output.join("\n"));
        }
    }

    /// Folds the prompt's light, terrain, and riding glyphs into the
    /// current room.
    fn update_room_flags_from_prompt(&mut self) {
        let Some(caps) = PROMPT_REGEX.captures(&self.prompt) else {
            return;
        };
        let mut output = Vec::new();
        let (light, terrain, ridable) = {
            let world = self.world.read();
            let Some(room) = world.current() else { return };
            (room.light, room.terrain, room.ridable)
        };
        if let Some(symbol) = caps.name("light").and_then(|m| m.as_str().chars().next()) {
            if Light::from_symbol(symbol) == Some(Light::Lit) && light != Light::Lit {
                output.push(self.world.write().rlight("lit"));
            }
        }
        if let Some(symbol) = caps.name("terrain").and_then(|m| m.as_str().chars().next()) {
            if let Some(seen) = Terrain::from_symbol(symbol) {
                if terrain != seen && terrain != Terrain::Deathtrap {
                    output.push(self.world.write().rterrain(seen.as_str()));
                }
            }
        }
        let riding = caps
            .name("movement_flags")
            .is_some_and(|m| m.as_str().to_lowercase().contains('r'));
        if riding && ridable != Ridable::Ridable {
            output.push(self.world.write().rridable("ridable"));
        }
        if !output.is_empty() {
            self.send_player(&output.join("\n"));
        }
    }

    /// Ingests an exits listing: creates missing exits, auto-links by
    /// coordinates, and adds door/road/climb flags.
    fn update_exit_flags(&mut self, exits_text: &str) {
        let auto_linking = self.auto_linking;
        let mut output = Vec::new();
        for caps in EXIT_TAGS_REGEX.captures_iter(exits_text) {
            // Portals aren't real exits.
            if !caps["portal"].is_empty() {
                continue;
            }
            let Ok(direction) = caps["direction"].parse::<Direction>() else {
                continue;
            };
            let missing = {
                let world = self.world.read();
                world
                    .current()
                    .is_some_and(|room| !room.exits.contains_key(&direction))
            };
            if missing {
                output.push(format!("Adding exit '{direction}' to current room."));
                {
                    let mut world = self.world.write();
                    if let Some(room) = world.current_mut() {
                        room.exits.entry(direction).or_default();
                    }
                }
                if auto_linking {
                    let candidate = {
                        let world = self.world.read();
                        let Some(current) = world.current() else { continue };
                        let target =
                            World::coordinates_add_direction(current.coordinates(), direction);
                        let vnums = world.rooms_at(target);
                        match vnums.as_slice() {
                            [vnum] => {
                                let back_is_free = world.rooms[vnum]
                                    .exits
                                    .get(&direction.reverse())
                                    .is_some_and(|exit| exit.to == ExitDestination::Undefined);
                                back_is_free.then(|| vnum.clone())
                            }
                            _ => None,
                        }
                    };
                    if let Some(vnum) = candidate {
                        output.push(self.world.write().rlink(&format!("add {vnum} {direction}")));
                    }
                }
            }
            let (has_door, has_road, has_climb) = {
                let world = self.world.read();
                match world.current().and_then(|room| room.exits.get(&direction)) {
                    Some(exit) => (
                        exit.has_flag(ExitFlag::Door),
                        exit.has_flag(ExitFlag::Road),
                        exit.has_flag(ExitFlag::Climb),
                    ),
                    None => continue,
                }
            };
            if !caps["door"].is_empty() && !has_door {
                output.push(self.world.write().exitflags(&format!("add door {direction}")));
            }
            if !caps["road"].is_empty() && !has_road {
                output.push(self.world.write().exitflags(&format!("add road {direction}")));
            }
            if !caps["climb"].is_empty() && !has_climb {
                output.push(
                    self.world
                        .write()
                        .exitflags(&format!("add climb {direction}")),
                );
            }
        }
        if !output.is_empty() {
            self.send_player(&output.join("\n"));
        }
    }

    /// Reports the doors, death traps, one-way and undefined exits, and
    /// note of the room just arrived in.
    fn room_details(&self) {
        let world = self.world.read();
        let Some(room) = world.current() else { return };
        let mut doors = Vec::new();
        let mut death_traps = Vec::new();
        let mut one_ways = Vec::new();
        let mut undefineds = Vec::new();
        for (direction, exit) in &room.exits {
            if !exit.door.is_empty() && exit.door != "exit" {
                doors.push(format!("{direction}: {}", exit.door));
            }
            match &exit.to {
                ExitDestination::Undefined => undefineds.push(direction.as_str()),
                ExitDestination::Death => death_traps.push(direction.as_str()),
                ExitDestination::Room(_) => {
                    if !world.is_bidirectional(&room.vnum, *direction, exit) {
                        one_ways.push(direction.as_str());
                    }
                }
            }
        }
        let mut lines = Vec::new();
        if !doors.is_empty() {
            lines.push(format!("Doors: {}", doors.join(", ")));
        }
        if !death_traps.is_empty() {
            lines.push(format!("Death Traps: {}", death_traps.join(", ")));
        }
        if !one_ways.is_empty() {
            lines.push(format!("One ways: {}", one_ways.join(", ")));
        }
        if !undefineds.is_empty() {
            lines.push(format!("Undefineds: {}", undefineds.join(", ")));
        }
        if !room.note.is_empty() {
            lines.push(format!("Note: {}", room.note));
        }
        drop(world);
        for line in lines {
            self.send_player_with(&line, false);
        }
    }

    // --- sync ---------------------------------------------------------------

    /// Forces the current room to a vnum or label.
    pub fn sync_to(&mut self, text: &str) {
        let resolved = self.world.read().room_from_label(text);
        match resolved {
            Ok(vnum) => {
                let name = {
                    let mut world = self.world.write();
                    world.current_vnum = vnum.clone();
                    world.is_synced = true;
                    world.current().map(|room| room.name.clone()).unwrap_or_default()
                };
                self.should_notify_not_synced = true;
                self.send_player(&format!("Synced to room {name} with vnum {vnum}"));
            }
            Err(message) => self.send_player(&message),
        }
    }

    /// The sync protocol: server ID first, then exact name+description,
    /// then description alone, then name alone.
    pub fn sync(&mut self) -> bool {
        let name = self.room_name.clone().filter(|name| !name.is_empty());
        let desc = self.description.clone().filter(|desc| !desc.is_empty());
        let server_id = self.xml_room_attrs.get("id").cloned();

        let mut server_id_vnum = None;
        let mut name_vnums = Vec::new();
        let mut desc_vnums = Vec::new();
        {
            let world = self.world.read();
            for (vnum, room) in &world.rooms {
                if let Some(id) = &server_id {
                    if !id.is_empty() && id != "0" && room.server_id == *id {
                        server_id_vnum = Some(vnum.clone());
                        break;
                    }
                }
                if name.as_deref() == Some(room.name.as_str()) {
                    name_vnums.push(vnum.clone());
                }
                if desc.as_deref() == Some(room.desc.as_str()) {
                    desc_vnums.push(vnum.clone());
                }
            }
        }

        let name_desc: Vec<&String> = name_vnums
            .iter()
            .filter(|vnum| desc_vnums.contains(*vnum))
            .collect();
        let chosen = if let Some(vnum) = server_id_vnum {
            Some((vnum, "Synced server ID"))
        } else if let [only] = name_desc.as_slice() {
            Some(((*only).clone(), "Synced name and desc"))
        } else if let [only] = desc_vnums.as_slice() {
            Some((only.clone(), "Desc-only synced"))
        } else if let [only] = name_vnums.as_slice() {
            Some((only.clone(), "Name-only synced"))
        } else {
            None
        };

        match chosen {
            Some((vnum, how)) => {
                let room_name = {
                    let mut world = self.world.write();
                    world.current_vnum = vnum.clone();
                    world.is_synced = true;
                    world.current().map(|room| room.name.clone()).unwrap_or_default()
                };
                self.should_notify_not_synced = true;
                self.send_player(&format!("{how} to room {room_name} with vnum {vnum}"));
                true
            }
            None => {
                if self.should_notify_not_synced {
                    self.should_notify_not_synced = false;
                    let reason = if name_vnums.is_empty() && desc_vnums.is_empty() {
                        "Current room not in the database."
                    } else {
                        "More than one room in the database matches current room."
                    };
                    self.send_player(&format!("{reason} Unable to sync."));
                }
                false
            }
        }
    }

    // --- walker -------------------------------------------------------------

    /// Pops the next command off the walk queue: directions go out as one
    /// letter, auxiliary commands verbatim until a direction is sent.
    pub fn walk_next_direction(&mut self) {
        while let Some(command) = self.auto_walk_directions.pop() {
            if self.auto_walk_directions.is_empty() {
                self.send_player("Arriving at destination.");
                self.auto_walk = false;
            }
            match command.parse::<Direction>() {
                Ok(direction) => {
                    self.send_game(&direction.letter().to_string());
                    break;
                }
                Err(()) => self.send_game(&command),
            }
        }
    }

    pub fn stop_run(&mut self) {
        self.auto_walk = false;
        self.auto_walk_directions.clear();
    }

    fn path_find_command(&mut self, destination: &str, flags: Option<&str>) -> Option<Vec<String>> {
        let (origin, resolved) = {
            let world = self.world.read();
            if world.current_vnum == NO_LOCATION {
                drop(world);
                self.send_player(
                    "Error! The mapper has no location. Please use the sync command then try \
                     again.",
                );
                return None;
            }
            (world.current_vnum.clone(), world.room_from_label(destination))
        };
        let destination = match resolved {
            Ok(vnum) => vnum,
            Err(message) => {
                self.send_player(&message);
                return None;
            }
        };
        if destination == origin {
            self.send_player("You are already there!");
            return Some(Vec::new());
        }
        let flag_list: Vec<&str> = flags
            .map(|flags| flags.split('|').collect())
            .unwrap_or_default();
        let avoid = avoid_terrains_from_flags(&flag_list);
        let result = pathfind::path_find(&self.world.read(), &origin, &destination, &avoid);
        if result.is_none() {
            self.send_player("No routes found.");
        }
        result
    }

    // --- user commands ------------------------------------------------------

    fn user_command_automap(&mut self, args: &str) {
        self.auto_mapping = toggle(self.auto_mapping, args);
        self.send_player(&format!(
            "Auto Mapping {}.",
            on_off(self.auto_mapping)
        ));
    }

    fn user_command_automerge(&mut self, args: &str) {
        self.auto_merging = toggle(self.auto_merging, args);
        self.send_player(&format!("Auto Merging {}.", on_off(self.auto_merging)));
    }

    fn user_command_autolink(&mut self, args: &str) {
        self.auto_linking = toggle(self.auto_linking, args);
        self.send_player(&format!("Auto Linking {}.", on_off(self.auto_linking)));
    }

    fn user_command_autoupdate(&mut self, args: &str) {
        self.auto_update_rooms = toggle(self.auto_update_rooms, args);
        self.config.set_auto_update_rooms(self.auto_update_rooms);
        self.config.save();
        self.send_player(&format!(
            "Auto update rooms {}.",
            on_off(self.auto_update_rooms)
        ));
    }

    pub fn auto_update_rooms(&self) -> bool {
        self.auto_update_rooms
    }

    fn user_command_rdelete(&mut self, args: &str) {
        let output = self.world.write().rdelete(args);
        self.send_player(&output);
    }

    fn user_command_revnum(&mut self, args: &str) {
        let output = self.world.write().revnum(args);
        self.send_player(&output);
    }

    fn user_command_rnote(&mut self, args: &str) {
        let output = self.world.write().rnote(args);
        self.send_player(&output);
    }

    fn user_command_ralign(&mut self, args: &str) {
        let output = self.world.write().ralign(args);
        self.send_player(&output);
    }

    fn user_command_rlight(&mut self, args: &str) {
        let output = self.world.write().rlight(args);
        self.send_player(&output);
    }

    fn user_command_rportable(&mut self, args: &str) {
        let output = self.world.write().rportable(args);
        self.send_player(&output);
    }

    fn user_command_rridable(&mut self, args: &str) {
        let output = self.world.write().rridable(args);
        self.send_player(&output);
    }

    fn user_command_rsundeath(&mut self, args: &str) {
        let output = self.world.write().rsundeath(args);
        self.send_player(&output);
    }

    fn user_command_ravoid(&mut self, args: &str) {
        let output = self.world.write().ravoid(args);
        self.send_player(&output);
    }

    fn user_command_rterrain(&mut self, args: &str) {
        let output = self.world.write().rterrain(args);
        self.send_player(&output);
    }

    fn user_command_rx(&mut self, args: &str) {
        let output = self.world.write().rcoordinate('x', args);
        self.send_player(&output);
    }

    fn user_command_ry(&mut self, args: &str) {
        let output = self.world.write().rcoordinate('y', args);
        self.send_player(&output);
    }

    fn user_command_rz(&mut self, args: &str) {
        let output = self.world.write().rcoordinate('z', args);
        self.send_player(&output);
    }

    fn user_command_rmobflags(&mut self, args: &str) {
        let output = self.world.write().rmobflags(args);
        self.send_player(&output);
    }

    fn user_command_rloadflags(&mut self, args: &str) {
        let output = self.world.write().rloadflags(args);
        self.send_player(&output);
    }

    fn user_command_exitflags(&mut self, args: &str) {
        let output = self.world.write().exitflags(args);
        self.send_player(&output);
    }

    fn user_command_doorflags(&mut self, args: &str) {
        let output = self.world.write().doorflags(args);
        self.send_player(&output);
    }

    pub fn user_command_secret(&mut self, args: &str) {
        let output = self.world.write().secret(args);
        self.send_player(&output);
    }

    fn user_command_rlink(&mut self, args: &str) {
        let output = self.world.write().rlink(args);
        self.send_player(&output);
    }

    fn user_command_rinfo(&mut self, args: &str) {
        let output = self.world.read().rinfo(args);
        self.send_player(&output);
    }

    fn user_command_rlabel(&mut self, args: &str) {
        let data_dir = self.data_dir.clone();
        let output = self.world.write().rlabel(args, &data_dir);
        self.send_player(&output);
    }

    fn user_command_getlabel(&mut self, args: &str) {
        let output = self.world.read().getlabel(args);
        self.send_player(&output);
    }

    fn user_command_vnum(&mut self, _args: &str) {
        let vnum = self.world.read().current_vnum.clone();
        self.send_player(&format!("Vnum: {vnum}."));
    }

    fn user_command_tvnum(&mut self, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            self.send_player("Tell VNum to who?");
        } else {
            let vnum = self.world.read().current_vnum.clone();
            self.send_game(&format!("tell {args} {vnum}"));
        }
    }

    fn user_command_fdoor(&mut self, args: &str) {
        let output = self.world.read().fdoor(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_fdynamic(&mut self, args: &str) {
        let output = self.world.read().fdynamic(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_flabel(&mut self, args: &str) {
        let output = self.world.read().flabel(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_fname(&mut self, args: &str) {
        let output = self.world.read().fname(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_fnote(&mut self, args: &str) {
        let output = self.world.read().fnote(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_farea(&mut self, args: &str) {
        let output = self.world.read().farea(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_fsid(&mut self, args: &str) {
        let output = self.world.read().fsid(&self.find_format, args);
        self.send_player(&output);
    }

    fn user_command_savemap(&mut self, _args: &str) {
        let result = self.world.read().save(&self.data_dir);
        match result {
            Ok(()) => self.send_player("Map Database saved."),
            Err(error) => self.send_player(&format!("Error saving map: {error}")),
        }
    }

    fn user_command_run(&mut self, args: &str) {
        let arg_string = args.trim();
        if arg_string.is_empty() {
            self.send_player("Usage: run [label|vnum]");
            return;
        }
        self.stop_run();
        if arg_string == "t" || arg_string.starts_with("t ") {
            let rest = arg_string[1..].trim();
            if rest.is_empty() {
                if self.last_path_find_query.is_empty() {
                    self.send_player("Please specify a VNum or room label to target.");
                } else {
                    self.send_player(&format!(
                        "Run target set to '{}'. Use 'run t [rlabel|vnum]' to change it.",
                        self.last_path_find_query
                    ));
                }
                return;
            }
            self.last_path_find_query = rest.to_owned();
            self.send_player(&format!(
                "Setting run target to '{}'",
                self.last_path_find_query
            ));
            return;
        }
        let query = if arg_string == "c" {
            if self.last_path_find_query.is_empty() {
                self.send_player("Error: no previous path to continue.");
                return;
            }
            self.last_path_find_query.clone()
        } else {
            arg_string.to_owned()
        };
        let (destination, flags) = parse_run_destination(&query);
        if let Some(commands) = self.path_find_command(&destination, flags.as_deref()) {
            self.auto_walk = true;
            if !commands.is_empty() {
                if arg_string != "c" {
                    self.last_path_find_query = arg_string.to_owned();
                }
                self.auto_walk_directions.extend(commands);
                self.walk_next_direction();
            }
        }
    }

    fn user_command_step(&mut self, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            self.send_player("Usage: step [label|vnum]");
            return;
        }
        self.auto_walk_directions.clear();
        let (destination, flags) = parse_run_destination(args);
        if let Some(commands) = self.path_find_command(&destination, flags.as_deref()) {
            self.auto_walk_directions.extend(commands);
            self.walk_next_direction();
        }
    }

    fn user_command_stop(&mut self, _args: &str) {
        self.stop_run();
        self.send_player("Run canceled!");
    }

    fn user_command_path(&mut self, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            self.send_player("Usage: path [label|vnum]");
            return;
        }
        let (destination, flags) = parse_run_destination(args);
        if let Some(commands) = self.path_find_command(&destination, flags.as_deref()) {
            if !commands.is_empty() {
                self.send_player(&pathfind::create_speed_walk(&commands));
            }
        }
    }

    fn user_command_sync(&mut self, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            self.send_player("Map no longer synced. Auto sync on.");
            self.world.write().is_synced = false;
            self.send_game("look");
        } else {
            self.sync_to(args);
        }
    }

    fn user_command_clock(&mut self, _args: &str) {
        self.send_player(&self.clock.time());
    }

    pub fn set_clock_epoch(&mut self, epoch: u64) {
        self.clock.set_epoch(epoch);
    }

    /// Performs an action on a door without revealing its name: `secretaction
    /// [action] [direction]`.
    fn user_command_secretaction(&mut self, args: &str) {
        let text = args.trim();
        if text.is_empty() {
            self.send_player(&format!(
                "Syntax: 'secretaction [action] [{}]'.",
                Direction::joined(" | ")
            ));
            return;
        }
        let (action, direction) = match text.rsplit_once(char::is_whitespace) {
            Some((action, last)) => match Direction::from_prefix(&last.to_lowercase()) {
                Some(direction) => (action.trim().to_owned(), Some(direction)),
                None => (text.to_owned(), None),
            },
            None => (text.to_owned(), None),
        };
        let door = {
            let world = self.world.read();
            direction
                .and_then(|direction| {
                    world
                        .current()
                        .and_then(|room| room.exits.get(&direction))
                        .map(|exit| exit.door.clone())
                })
                .filter(|door| !door.is_empty())
                .unwrap_or_else(|| "exit".to_owned())
        };
        let mut parts = vec![action, door];
        if let Some(direction) = direction {
            parts.push(direction.letter().to_string());
        }
        self.send_game(&parts.join(" "));
    }

    fn user_command_emu(&mut self, args: &str) {
        emulation::user_command_emu(self, args);
    }

    fn user_command_maphelp(&mut self, _args: &str) {
        let names: Vec<&str> = USER_COMMANDS.iter().map(|(name, _)| *name).collect();
        self.send_player(&format!(
            "Mapper Commands\nThe following commands are used for viewing and editing map \
             data:\n{}",
            names.join(", ")
        ));
    }

}

fn toggle(current: bool, args: &str) -> bool {
    let args = args.trim().to_lowercase();
    if args.is_empty() {
        !current
    } else {
        args == "on"
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Splits a run query into destination and the optional trailing flag
/// token, e.g. `ingrove nowater|noroad`.
fn parse_run_destination(text: &str) -> (String, Option<String>) {
    match text.rsplit_once(char::is_whitespace) {
        Some((destination, flags)) if !destination.trim().is_empty() => {
            (destination.trim().to_owned(), Some(flags.to_owned()))
        }
        _ => (text.trim().to_owned(), None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;
    use wayfinder_map::Room;

    use super::*;

    pub(crate) struct Harness {
        pub mapper: Mapper,
        pub player_rx: flume::Receiver<WriteMessage>,
        pub game_rx: flume::Receiver<WriteMessage>,
    }

    impl Harness {
        pub(crate) fn new(world: World) -> Self {
            let (player_tx, player_rx) = flume::unbounded();
            let (game_tx, game_rx) = flume::unbounded();
            let mapper = Mapper::new(
                Arc::new(RwLock::new(world)),
                Config::default(),
                MapperOptions::default(),
                player_tx,
                game_tx,
            );
            Self {
                mapper,
                player_rx,
                game_rx,
            }
        }

        pub(crate) fn player_messages(&self) -> Vec<String> {
            self.player_rx
                .drain()
                .map(|message| match message {
                    WriteMessage::Data { bytes, .. } => {
                        String::from_utf8_lossy(&bytes).trim().to_owned()
                    }
                    WriteMessage::Raw(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                })
                .collect()
        }

        pub(crate) fn game_commands(&self) -> Vec<String> {
            self.game_rx
                .drain()
                .map(|message| match message {
                    WriteMessage::Data { bytes, .. } => {
                        String::from_utf8_lossy(&bytes).trim().to_owned()
                    }
                    WriteMessage::Raw(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                })
                .collect()
        }
    }

    fn base_world() -> World {
        let mut world = World::new();
        let mut room = Room::new("0");
        room.name = "Entrance Hall".to_owned();
        room.desc = "A wide hall.".to_owned();
        world.rooms.insert("0".to_owned(), room);
        world.current_vnum = "0".to_owned();
        world.is_synced = true;
        world
    }

    fn arrive(harness: &mut Harness, direction: &str, name: &str, desc: &str) {
        harness.mapper.dispatch_mud_event("movement", direction);
        harness.mapper.dispatch_mud_event("room", " id=\"0\"");
        harness.mapper.dispatch_mud_event("name", name);
        harness.mapper.dispatch_mud_event("description", desc);
        harness.mapper.dispatch_mud_event("dynamic", "");
        harness.mapper.dispatch_mud_event("prompt", "o> ");
    }

    #[test]
    fn unknown_movement_creates_room_with_shifted_coordinates() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_mapping = true;
        arrive(&mut harness, "east", "Garden", "A small garden.");

        let world = harness.mapper.world.read();
        assert_eq!(world.current_vnum, "1");
        let room = &world.rooms["1"];
        assert_eq!(room.name, "Garden");
        assert_eq!(room.coordinates(), (1, 0, 0));
        assert_eq!(
            world.rooms["0"].exits[&Direction::East].to,
            ExitDestination::Room("1".to_owned())
        );
    }

    #[test]
    fn arrival_exits_listing_links_the_way_back() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_mapping = true;
        harness.mapper.dispatch_mud_event("movement", "east");
        harness.mapper.dispatch_mud_event("name", "Garden");
        harness
            .mapper
            .dispatch_mud_event("description", "A small garden.");
        harness.mapper.dispatch_mud_event("exits", "Exits: west.\n");
        harness.mapper.dispatch_mud_event("dynamic", "");

        let world = harness.mapper.world.read();
        assert_eq!(world.current_vnum, "1");
        assert_eq!(
            world.rooms["1"].exits[&Direction::West].to,
            ExitDestination::Room("0".to_owned())
        );
    }

    #[test]
    fn automerge_links_to_unique_matching_room() {
        let mut world = base_world();
        let mut garden = Room::new("7");
        garden.name = "Garden".to_owned();
        garden.desc = "A small garden.".to_owned();
        garden
            .exits
            .insert(Direction::West, Exit::new(ExitDestination::Undefined));
        world.rooms.insert("7".to_owned(), garden);
        let mut harness = Harness::new(world);
        harness.mapper.auto_mapping = true;
        arrive(&mut harness, "east", "Garden", "A small garden.");

        let world = harness.mapper.world.read();
        assert_eq!(world.current_vnum, "7");
        assert_eq!(
            world.rooms["0"].exits[&Direction::East].to,
            ExitDestination::Room("7".to_owned())
        );
        // The undefined reverse exit became a back-link.
        assert_eq!(
            world.rooms["7"].exits[&Direction::West].to,
            ExitDestination::Room("0".to_owned())
        );
    }

    #[test]
    fn automerge_without_free_reverse_is_one_way() {
        let mut world = base_world();
        let mut garden = Room::new("7");
        garden.name = "Garden".to_owned();
        garden.desc = "A small garden.".to_owned();
        garden.exits.insert(
            Direction::West,
            Exit::new(ExitDestination::Room("9".to_owned())),
        );
        let other = Room::new("9");
        world.rooms.insert("9".to_owned(), other);
        world.rooms.insert("7".to_owned(), garden);
        let mut harness = Harness::new(world);
        harness.mapper.auto_mapping = true;
        arrive(&mut harness, "east", "Garden", "A small garden.");

        let world = harness.mapper.world.read();
        assert_eq!(world.current_vnum, "7");
        // The existing reverse link stays untouched.
        assert_eq!(
            world.rooms["7"].exits[&Direction::West].to,
            ExitDestination::Room("9".to_owned())
        );
    }

    #[test]
    fn sync_prefers_server_id_over_ambiguous_names() {
        let mut world = World::new();
        for (vnum, server_id) in [("0", "100"), ("1", "200")] {
            let mut room = Room::new(vnum);
            room.name = "Hall".to_owned();
            room.desc = "empty".to_owned();
            room.server_id = server_id.to_owned();
            world.rooms.insert(vnum.to_owned(), room);
        }
        world.current_vnum = NO_LOCATION.to_owned();
        let mut harness = Harness::new(world);
        harness.mapper.dispatch_mud_event("room", " id=\"200\"");
        harness.mapper.dispatch_mud_event("name", "Hall");
        harness.mapper.dispatch_mud_event("description", "empty");
        harness.mapper.dispatch_mud_event("dynamic", "");
        harness.mapper.dispatch_mud_event("prompt", "o> ");

        let world = harness.mapper.world.read();
        assert!(world.is_synced);
        assert_eq!(world.current_vnum, "1");
    }

    #[test]
    fn sync_by_unique_name_and_desc() {
        let mut world = World::new();
        let mut a = Room::new("0");
        a.name = "Hall".to_owned();
        a.desc = "north side".to_owned();
        let mut b = Room::new("1");
        b.name = "Hall".to_owned();
        b.desc = "south side".to_owned();
        world.rooms.insert("0".to_owned(), a);
        world.rooms.insert("1".to_owned(), b);
        world.current_vnum = NO_LOCATION.to_owned();
        let mut harness = Harness::new(world);
        harness.mapper.dispatch_mud_event("name", "Hall");
        harness.mapper.dispatch_mud_event("description", "south side");
        harness.mapper.dispatch_mud_event("prompt", "o> ");

        let world = harness.mapper.world.read();
        assert!(world.is_synced);
        assert_eq!(world.current_vnum, "1");
    }

    #[test]
    fn failed_sync_notifies_once() {
        let mut world = World::new();
        for vnum in ["0", "1"] {
            let mut room = Room::new(vnum);
            room.name = "Twin".to_owned();
            room.desc = "same".to_owned();
            world.rooms.insert(vnum.to_owned(), room);
        }
        world.current_vnum = NO_LOCATION.to_owned();
        let mut harness = Harness::new(world);
        for _ in 0..2 {
            harness.mapper.dispatch_mud_event("name", "Twin");
            harness.mapper.dispatch_mud_event("description", "same");
            harness.mapper.dispatch_mud_event("prompt", "o> ");
        }
        let notices: Vec<String> = harness
            .player_messages()
            .into_iter()
            .filter(|message| message.contains("Unable to sync"))
            .collect();
        assert_eq!(notices.len(), 1, "the diagnostic must be debounced");
    }

    #[test]
    fn movement_without_exit_desyncs_when_not_auto_mapping() {
        let mut harness = Harness::new(base_world());
        harness.mapper.dispatch_mud_event("movement", "east");
        harness.mapper.dispatch_mud_event("dynamic", "");
        assert!(!harness.mapper.world.read().is_synced);
        let messages = harness.player_messages();
        assert!(
            messages.iter().any(|m| m.contains("not in database")),
            "{messages:?}"
        );
    }

    #[test]
    fn scouted_rooms_do_not_move_the_map() {
        let mut world = base_world();
        let mut garden = Room::new("1");
        garden.name = "Garden".to_owned();
        world.rooms.insert("1".to_owned(), garden);
        world.rooms.get_mut("0").unwrap().exits.insert(
            Direction::East,
            Exit::new(ExitDestination::Room("1".to_owned())),
        );
        let mut harness = Harness::new(world);
        harness
            .mapper
            .dispatch_mud_event("line", "You quietly scout east...");
        harness.mapper.dispatch_mud_event("name", "Garden");
        harness.mapper.dispatch_mud_event("dynamic", "");
        assert_eq!(harness.mapper.world.read().current_vnum, "0");
    }

    #[test]
    fn walker_sends_one_letter_per_direction_and_stops() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_walk = true;
        // Stack order: the first command to send sits at the end.
        harness.mapper.auto_walk_directions = vec![
            "north".to_owned(),
            "east".to_owned(),
            "open gate east".to_owned(),
        ];
        harness.mapper.walk_next_direction();
        // The door opens first, then exactly one movement goes out.
        assert_eq!(harness.game_commands(), vec!["open gate east", "e"]);
        harness.mapper.walk_next_direction();
        assert_eq!(harness.game_commands(), vec!["n"]);
        assert!(!harness.mapper.auto_walk, "arrival clears the autowalk flag");
        assert!(harness.mapper.auto_walk_directions.is_empty());
    }

    #[test]
    fn stop_clears_walker_state() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_walk = true;
        harness.mapper.auto_walk_directions = vec!["north".to_owned()];
        harness.mapper.handle_user_input("stop");
        assert!(!harness.mapper.auto_walk);
        assert!(harness.mapper.auto_walk_directions.is_empty());
    }

    #[test]
    fn forced_movement_line_cancels_walk() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_walk = true;
        harness.mapper.auto_walk_directions = vec!["north".to_owned()];
        harness
            .mapper
            .dispatch_mud_event("line", "You are swept away by the current.");
        assert!(!harness.mapper.auto_walk);
        assert!(harness.mapper.auto_walk_directions.is_empty());
    }

    #[test]
    fn prevented_movement_line_cancels_walk() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_walk = true;
        harness.mapper.auto_walk_directions = vec!["north".to_owned()];
        harness
            .mapper
            .dispatch_mud_event("line", "Alas, you cannot go that way...");
        assert!(!harness.mapper.auto_walk);
    }

    #[test]
    fn prompt_glyphs_update_room_flags() {
        let mut harness = Harness::new(base_world());
        harness.mapper.auto_mapping = true;
        harness.mapper.moved = Some(Direction::North);
        harness.mapper.dynamic = Some(String::new());
        harness.mapper.dispatch_mud_event("prompt", "*# R>");
        let world = harness.mapper.world.read();
        let room = world.current().unwrap();
        assert_eq!(room.light, Light::Lit);
        assert_eq!(room.terrain, Terrain::City);
        assert_eq!(room.ridable, Ridable::Ridable);
    }

    #[test]
    fn exits_listing_adds_flags_to_existing_exits() {
        let mut world = base_world();
        world.rooms.get_mut("0").unwrap().exits.insert(
            Direction::North,
            Exit::new(ExitDestination::Room("0".to_owned())),
        );
        let mut harness = Harness::new(world);
        harness.mapper.auto_mapping = true;
        harness.mapper.moved = Some(Direction::North);
        let listing = "Exits: (north), =east=.".to_owned();
        harness.mapper.update_exit_flags(&listing);
        let world = harness.mapper.world.read();
        let north = &world.rooms["0"].exits[&Direction::North];
        assert!(north.has_flag(ExitFlag::Door));
        let east = &world.rooms["0"].exits[&Direction::East];
        assert!(east.has_flag(ExitFlag::Road));
        assert_eq!(east.to, ExitDestination::Undefined);
    }

    #[test]
    fn user_input_routes_to_commands() {
        let mut harness = Harness::new(base_world());
        harness.mapper.handle_user_input("vnum");
        let messages = harness.player_messages();
        assert!(messages.iter().any(|m| m.contains("Vnum: 0.")), "{messages:?}");
    }

    #[test]
    fn secretaction_uses_door_name() {
        let mut world = base_world();
        let mut exit = Exit::new(ExitDestination::Undefined);
        exit.door = "hatch".to_owned();
        world
            .rooms
            .get_mut("0")
            .unwrap()
            .exits
            .insert(Direction::Down, exit);
        let mut harness = Harness::new(world);
        harness.mapper.handle_user_input("secretaction open down");
        assert_eq!(harness.game_commands(), vec!["open hatch d"]);
    }

    #[test]
    fn run_target_is_remembered() {
        let mut world = base_world();
        let mut garden = Room::new("1");
        garden.name = "Garden".to_owned();
        world.rooms.insert("1".to_owned(), garden);
        world.rooms.get_mut("0").unwrap().exits.insert(
            Direction::East,
            Exit::new(ExitDestination::Room("1".to_owned())),
        );
        let mut harness = Harness::new(world);
        harness.mapper.handle_user_input("run t 1");
        harness.mapper.handle_user_input("run c");
        assert_eq!(harness.game_commands(), vec!["e"]);
        // The single hop was also the last: arrival ends the walk.
        assert!(!harness.mapper.auto_walk);
    }

    #[test]
    fn already_there_reports_without_walking() {
        let mut harness = Harness::new(base_world());
        harness.mapper.handle_user_input("run 0");
        let messages = harness.player_messages();
        assert!(
            messages.iter().any(|m| m.contains("You are already there!")),
            "{messages:?}"
        );
        assert!(harness.game_commands().is_empty());
    }

    #[test]
    fn simplified_collapses_whitespace() {
        assert_eq!(simplified("a  b\n c\t"), "a b c");
    }

    #[test]
    fn ansi_is_stripped_before_dispatch() {
        assert_eq!(strip_ansi("\x1b[35mLower Flet\x1b[0m"), "Lower Flet");
    }
}
