//! The `emu` command dialect.
//!
//! Emulation walks a separate "emulated" location around the map without
//! moving the character, for exploring and editing offline. In offline mode
//! every user line is an emulation command and the emulated location doubles
//! as the real one.

use wayfinder_map::room::{Direction, ExitDestination};

use crate::mapper::{self, Mapper};

/// `exits` leads so that it wins prefix ties; the rest resolve
/// alphabetically.
const EMULATION_COMMANDS: &[&str] = &[
    "exits", "at", "brief", "dynamic", "examine", "go", "help", "look", "quit", "rename",
    "return", "sync",
];

pub fn user_command_emu(mapper: &mut Mapper, input: &str) {
    let input = input.trim();
    if input.is_empty() {
        mapper.send_player("What command do you want to emulate?");
        return;
    }
    let mut words: Vec<String> = input.split_whitespace().map(str::to_owned).collect();
    while !words.is_empty() {
        words = emulate_command(mapper, &words);
    }
}

/// Runs the first word as an emulation command and returns whatever input
/// it did not consume.
fn emulate_command(mapper: &mut Mapper, words: &[String]) -> Vec<String> {
    let command = words[0].to_lowercase();
    let args = &words[1..];
    if let Some(direction) = Direction::ALL
        .iter()
        .find(|direction| direction.as_str().starts_with(&command))
    {
        emulate_leave(mapper, *direction);
        return args.to_vec();
    }
    if let Some(name) = EMULATION_COMMANDS
        .iter()
        .find(|name| name.starts_with(&command))
    {
        return match *name {
            "at" => {
                command_at(mapper, args);
                Vec::new()
            }
            "brief" => {
                mapper.emulating_brief_mode = !mapper.emulating_brief_mode;
                mapper.send_player(&format!(
                    "Brief mode {}",
                    if mapper.emulating_brief_mode { "on" } else { "off" }
                ));
                args.to_vec()
            }
            "dynamic" => {
                mapper.emulating_dynamic_descs = !mapper.emulating_dynamic_descs;
                mapper.send_player(&format!(
                    "dynamic descs {}",
                    if mapper.emulating_dynamic_descs { "on" } else { "off" }
                ));
                args.to_vec()
            }
            "examine" => {
                let desc = emulation_room_field(mapper, |room| room.desc.clone());
                mapper.send_player(&desc);
                args.to_vec()
            }
            "exits" => {
                command_exits(mapper);
                args.to_vec()
            }
            "go" => match args.first().cloned() {
                Some(label) => {
                    command_go(mapper, &label, true);
                    args[1..].to_vec()
                }
                None => {
                    mapper.send_player("Go where?");
                    Vec::new()
                }
            },
            "help" => {
                mapper.send_player(&format!(
                    "The following commands allow you to emulate exploring the map without \
                     needing to move in game:\n    {}",
                    EMULATION_COMMANDS.join(", ")
                ));
                args.to_vec()
            }
            "look" => {
                command_look(mapper);
                args.to_vec()
            }
            "quit" => {
                mapper.send_game("quit");
                args.to_vec()
            }
            "rename" => {
                command_rename(mapper, &args.join(" "));
                Vec::new()
            }
            "return" => {
                command_return(mapper);
                args.to_vec()
            }
            "sync" => {
                if mapper.is_emulating_offline {
                    command_return(mapper);
                } else {
                    let current = mapper.world.read().current_vnum.clone();
                    command_go(mapper, &current, true);
                }
                args.to_vec()
            }
            _ => unreachable!("command list is exhaustive"),
        };
    }
    // Try a regular mapper command, executed at the emulated room.
    if let Some(handler) = mapper::find_user_command(&command) {
        let saved = mapper.world.read().current_vnum.clone();
        mapper.world.write().current_vnum = mapper.emulation_vnum.clone();
        handler(mapper, &args.join(" "));
        mapper.world.write().current_vnum = saved;
        return Vec::new();
    }
    // Otherwise the word may be a label or vnum to jump to.
    command_go(mapper, &command, true);
    args.to_vec()
}

fn emulation_room_field(mapper: &Mapper, field: impl Fn(&wayfinder_map::Room) -> String) -> String {
    let world = mapper.world.read();
    world
        .rooms
        .get(&mapper.emulation_vnum)
        .map(field)
        .unwrap_or_default()
}

fn emulate_leave(mapper: &mut Mapper, direction: Direction) {
    let destination = {
        let world = mapper.world.read();
        world
            .rooms
            .get(&mapper.emulation_vnum)
            .and_then(|room| room.exits.get(&direction))
            .map(|exit| exit.to.clone())
    };
    match destination {
        None => mapper.send_player("Alas, you cannot go that way..."),
        Some(ExitDestination::Death) => mapper.send_player("deathtrap!"),
        Some(ExitDestination::Undefined) => mapper.send_player("undefined"),
        Some(ExitDestination::Room(vnum)) => command_go(mapper, &vnum, false),
    }
}

fn command_go(mapper: &mut Mapper, label: &str, is_jump: bool) {
    let resolved = mapper.world.read().room_from_label(label);
    match resolved {
        Err(message) => mapper.send_player(&message),
        Ok(vnum) => {
            mapper.emulation_vnum = vnum.clone();
            command_look(mapper);
            command_exits(mapper);
            if mapper.is_emulating_offline {
                mapper.world.write().current_vnum = vnum.clone();
            }
            if is_jump {
                mapper.last_emulated_jump = Some(vnum);
            }
        }
    }
}

fn command_look(mapper: &Mapper) {
    let (name, desc, dynamic, note) = {
        let world = mapper.world.read();
        match world.rooms.get(&mapper.emulation_vnum) {
            Some(room) => (
                room.name.clone(),
                room.desc.clone(),
                room.dynamic_desc.clone(),
                room.note.clone(),
            ),
            None => return,
        }
    };
    mapper.send_player(&name);
    if !mapper.emulating_brief_mode {
        mapper.send_player(&desc);
    }
    if mapper.emulating_dynamic_descs && !dynamic.is_empty() {
        mapper.send_player(&dynamic);
    }
    if !note.is_empty() {
        mapper.send_player(&format!("Note: {note}"));
    }
}

fn command_exits(mapper: &Mapper) {
    let directions: Vec<&str> = {
        let world = mapper.world.read();
        match world.rooms.get(&mapper.emulation_vnum) {
            Some(room) => room.exits.keys().map(|direction| direction.as_str()).collect(),
            None => return,
        }
    };
    mapper.send_player(&format!("Exits: {}.", directions.join(", ")));
}

fn command_rename(mapper: &mut Mapper, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        mapper.send_player("Error: You must specify a new room name.");
        return;
    }
    let vnum = mapper.emulation_vnum.clone();
    let renamed = {
        let mut world = mapper.world.write();
        match world.rooms.get_mut(&vnum) {
            Some(room) => {
                room.name = name.to_owned();
                true
            }
            None => false,
        }
    };
    if renamed {
        mapper.send_player(&format!("Room name set to '{name}'."));
    }
}

fn command_return(mapper: &mut Mapper) {
    match mapper.last_emulated_jump.clone() {
        Some(vnum) => command_go(mapper, &vnum, true),
        None => mapper.send_player(
            "Cannot return anywhere until the go command has been used at least once.",
        ),
    }
}

/// `at <where> <command>`: runs an emulation command as if standing in
/// another room.
fn command_at(mapper: &mut Mapper, args: &[String]) {
    let Some(label) = args.first() else {
        mapper.send_player("Please provide a room in which to execute commands.");
        return;
    };
    let command = args[1..].join(" ");
    let resolved = mapper.world.read().room_from_label(label);
    match resolved {
        Err(message) => mapper.send_player(&message),
        Ok(vnum) => {
            if command.trim().is_empty() {
                mapper.send_player(&format!("What do you want to do at {label}?"));
                return;
            }
            let saved = mapper.emulation_vnum.clone();
            mapper.emulation_vnum = vnum;
            user_command_emu(mapper, &command);
            mapper.emulation_vnum = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use wayfinder_map::room::{Exit, ExitFlag};
    use wayfinder_map::{Room, World};

    use super::*;
    use crate::mapper::tests::Harness;

    fn world() -> World {
        let mut world = World::new();
        let mut hall = Room::new("0");
        hall.name = "Hall".to_owned();
        hall.desc = "A hall.".to_owned();
        let mut garden = Room::new("1");
        garden.name = "Garden".to_owned();
        garden.dynamic_desc = "A bird sings here.\n".to_owned();
        hall.exits.insert(
            Direction::East,
            Exit::new(ExitDestination::Room("1".to_owned())),
        );
        garden
            .exits
            .insert(Direction::Down, Exit::new(ExitDestination::Death));
        world.rooms.insert("0".to_owned(), hall);
        world.rooms.insert("1".to_owned(), garden);
        world.labels.insert("garden".to_owned(), "1".to_owned());
        world.current_vnum = "0".to_owned();
        world.is_synced = true;
        world
    }

    #[test]
    fn go_jumps_and_looks() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu go garden");
        assert_eq!(harness.mapper.emulation_vnum, "1");
        assert_eq!(harness.mapper.last_emulated_jump.as_deref(), Some("1"));
        let messages = harness.player_messages();
        assert!(messages.iter().any(|m| m.contains("Garden")), "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("Exits: down.")), "{messages:?}");
    }

    #[test]
    fn abbreviated_direction_walks_the_emulated_room() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu e");
        assert_eq!(harness.mapper.emulation_vnum, "1");
        // The real location did not move.
        assert_eq!(harness.mapper.world.read().current_vnum, "0");
    }

    #[test]
    fn deathtrap_exits_warn_instead_of_moving() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu go garden");
        harness.player_messages();
        harness.mapper.handle_user_input("emu d");
        assert_eq!(harness.mapper.emulation_vnum, "1");
        let messages = harness.player_messages();
        assert!(messages.iter().any(|m| m.contains("deathtrap!")), "{messages:?}");
    }

    #[test]
    fn return_revisits_the_last_jump() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu go garden");
        harness.mapper.handle_user_input("emu go 0");
        harness.mapper.handle_user_input("emu return");
        assert_eq!(harness.mapper.emulation_vnum, "0");
    }

    #[test]
    fn mapper_commands_run_at_the_emulated_room() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu go garden");
        harness.mapper.handle_user_input("emu rnote remember the bird");
        let world = harness.mapper.world.read();
        assert_eq!(world.rooms["1"].note, "remember the bird");
        assert!(world.rooms["0"].note.is_empty());
    }

    #[test]
    fn at_executes_elsewhere_and_restores() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu at garden exits");
        assert_eq!(harness.mapper.emulation_vnum, "0");
        let messages = harness.player_messages();
        assert!(messages.iter().any(|m| m.contains("Exits: down.")), "{messages:?}");
    }

    #[test]
    fn offline_mode_moves_the_real_location_too() {
        let mut harness = Harness::new(world());
        harness.mapper.is_emulating_offline = true;
        harness.mapper.handle_user_input("e");
        assert_eq!(harness.mapper.world.read().current_vnum, "1");
    }

    #[test]
    fn secret_exit_flags_stay_visible_to_emulation() {
        let mut harness = Harness::new(world());
        harness.mapper.handle_user_input("emu secret add gate east");
        let world = harness.mapper.world.read();
        assert!(world.rooms["0"].exits[&Direction::East]
            .exit_flags
            .contains(&ExitFlag::Door));
    }
}
