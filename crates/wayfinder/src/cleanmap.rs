//! Cleaning of erroneously hidden exits.
//!
//! The output of the in-game `exits` command lists each visible exit on its
//! own line, `East    - Open Plaza`. When such a line names a direction the
//! map marks as hidden, the secret has evidently been revealed and the
//! hidden flag is removed. Runs only in auto-update mode.

use std::sync::LazyLock;

use regex::Regex;
use wayfinder_map::room::{Direction, DoorFlag};

use crate::mapper::Mapper;

static DIRECTION_TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"North|East|South|West|Up|Down").expect("direction pattern"));

static EXIT_TAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +- .+").expect("exit tail pattern"));

/// Handler for the `exits` event.
pub fn clean_hidden_exits(mapper: &mut Mapper, text: &str) {
    // The one-line movement summary also starts `Exits:`; only the
    // long-form listing is of interest.
    if !mapper.auto_update_rooms() || text.starts_with("Exits:") {
        return;
    }
    for line in text.lines() {
        let Some(direction) = revealed_direction(line) else {
            continue;
        };
        let hidden = {
            let world = mapper.world.read();
            world.is_synced
                && world
                    .current()
                    .and_then(|room| room.exits.get(&direction))
                    .is_some_and(|exit| exit.door_flags.contains(&DoorFlag::Hidden))
        };
        if hidden {
            mapper.user_command_secret(&format!("remove {direction}"));
        }
    }
}

/// The direction named by an exits-command line, unless the listing marks
/// it as decorated (`#East#`, `(East)`).
fn revealed_direction(line: &str) -> Option<Direction> {
    for found in DIRECTION_TITLE_REGEX.find_iter(line) {
        let before = line[..found.start()].chars().next_back();
        let after = line[found.end()..].chars().next();
        if matches!(before, Some('#' | '(')) || matches!(after, Some('#' | ')')) {
            continue;
        }
        if EXIT_TAIL_REGEX.is_match(&line[found.end()..]) {
            return found.as_str().to_lowercase().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use wayfinder_map::room::{Exit, ExitDestination, ExitFlag};
    use wayfinder_map::{Room, World};

    use super::*;
    use crate::mapper::tests::Harness;

    fn world_with_hidden_east() -> World {
        let mut world = World::new();
        let mut room = Room::new("0");
        room.name = "Plaza Edge".to_owned();
        let mut exit = Exit::new(ExitDestination::Undefined);
        exit.exit_flags.insert(ExitFlag::Door);
        exit.door = "secret".to_owned();
        exit.door_flags.insert(DoorFlag::Hidden);
        room.exits.insert(Direction::East, exit);
        world.rooms.insert("0".to_owned(), room);
        world.current_vnum = "0".to_owned();
        world.is_synced = true;
        world
    }

    #[test]
    fn revealed_exit_line_clears_hidden_flag() {
        let mut harness = Harness::new(world_with_hidden_east());
        harness.mapper.auto_update_rooms = true;
        harness
            .mapper
            .dispatch_mud_event("exits", "East    - Open Plaza\n");
        let world = harness.mapper.world.read();
        let exit = &world.rooms["0"].exits[&Direction::East];
        assert!(!exit.door_flags.contains(&DoorFlag::Hidden));
        assert!(exit.door.is_empty());
    }

    #[test]
    fn movement_summary_is_ignored() {
        let mut harness = Harness::new(world_with_hidden_east());
        harness.mapper.auto_update_rooms = true;
        harness
            .mapper
            .dispatch_mud_event("exits", "Exits: east.\n");
        let world = harness.mapper.world.read();
        let exit = &world.rooms["0"].exits[&Direction::East];
        assert!(exit.door_flags.contains(&DoorFlag::Hidden));
    }

    #[test]
    fn decorated_directions_are_not_cleaned() {
        assert_eq!(revealed_direction("#East#   - A climb"), None);
        assert_eq!(revealed_direction("(East)   - A door"), None);
        assert_eq!(
            revealed_direction("East     - Open Plaza"),
            Some(Direction::East)
        );
        assert_eq!(revealed_direction("Nothing special here."), None);
    }

    #[test]
    fn cleaning_requires_auto_update_mode() {
        let mut harness = Harness::new(world_with_hidden_east());
        harness
            .mapper
            .dispatch_mud_event("exits", "East    - Open Plaza\n");
        let world = harness.mapper.world.read();
        let exit = &world.rooms["0"].exits[&Direction::East];
        assert!(exit.door_flags.contains(&DoorFlag::Hidden));
    }
}
