//! Weighted routing over the room graph.
//!
//! Best-first search on a binary heap keyed by accumulated cost. A room's
//! own cost is precomputed from terrain, avoidance, and ridability; edges
//! add penalties for doors, climbs, avoided exits, and terrains excluded by
//! run flags. The found path is walked backwards into a command stack that
//! the walker pops from the end, inserting `open`, `lead`, and `ride` where
//! the route demands them.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use ordered_float::OrderedFloat;

use crate::room::{Direction, Exit, ExitFlag, Room, Terrain};
use crate::world::World;

/// Rooms that require dismounting before entry; the route planner inserts
/// `lead` when entering this set and `ride` when leaving it.
pub const LEAD_BEFORE_ENTERING_VNUMS: [&str; 5] = ["196", "3473", "3474", "12138", "12637"];

/// Builds the avoided-terrain set from run flags such as `nowater`.
pub fn avoid_terrains_from_flags(flags: &[&str]) -> BTreeSet<Terrain> {
    Terrain::ALL
        .iter()
        .copied()
        .filter(|terrain| flags.contains(&format!("no{terrain}").as_str()))
        .collect()
}

fn exit_cost(exit: &Exit, neighbor: &Room, avoid_terrains: &BTreeSet<Terrain>) -> f64 {
    let mut cost = 0.0;
    if exit.has_flag(ExitFlag::Door) || exit.has_flag(ExitFlag::Climb) {
        cost += 5.0;
    }
    if exit.has_flag(ExitFlag::Avoid) {
        cost += 1000.0;
    }
    if avoid_terrains.contains(&neighbor.terrain) {
        cost += 10.0;
    }
    cost
}

/// Finds the cheapest route from `origin` to `destination`.
///
/// Returns the command stack in walker order: the first command to send is
/// at the end. `None` means no route exists; an empty stack means the
/// origin is the destination.
pub fn path_find(
    world: &World,
    origin: &str,
    destination: &str,
    avoid_terrains: &BTreeSet<Terrain>,
) -> Option<Vec<String>> {
    if origin == destination {
        return Some(Vec::new());
    }
    let origin_room = world.rooms.get(origin)?;

    let mut parents: HashMap<String, (String, Direction)> = HashMap::new();
    let mut opened: BinaryHeap<Reverse<(OrderedFloat<f64>, String)>> = BinaryHeap::new();
    let mut closed: HashMap<String, f64> = HashMap::new();
    opened.push(Reverse((OrderedFloat(origin_room.cost), origin.to_owned())));
    closed.insert(origin.to_owned(), origin_room.cost);

    let mut found = false;
    while let Some(Reverse((OrderedFloat(cost), vnum))) = opened.pop() {
        if vnum == destination {
            found = true;
            break;
        }
        let room = &world.rooms[&vnum];
        for (&direction, exit) in &room.exits {
            // Unmapped and deadly destinations are never routed through.
            let Some(neighbor_vnum) = exit.to.vnum() else {
                continue;
            };
            let Some(neighbor) = world.rooms.get(neighbor_vnum) else {
                continue;
            };
            let neighbor_cost = cost + neighbor.cost + exit_cost(exit, neighbor, avoid_terrains);
            let improves = closed
                .get(neighbor_vnum)
                .is_none_or(|&best| best > neighbor_cost);
            if improves {
                closed.insert(neighbor_vnum.to_owned(), neighbor_cost);
                opened.push(Reverse((
                    OrderedFloat(neighbor_cost),
                    neighbor_vnum.to_owned(),
                )));
                parents.insert(neighbor_vnum.to_owned(), (vnum.clone(), direction));
            }
        }
    }
    if !found {
        return None;
    }

    // Walk the parent chain back to the origin, last hop first.
    let lead_set: BTreeSet<&str> = LEAD_BEFORE_ENTERING_VNUMS.into_iter().collect();
    let mut results: Vec<String> = Vec::new();
    let mut current = destination.to_owned();
    while current != origin {
        let (parent, direction) = parents[&current].clone();
        let exit = &world.rooms[&parent].exits[&direction];
        let parent_leads = lead_set.contains(parent.as_str());
        let child_leads = lead_set.contains(current.as_str());
        if parent_leads && !child_leads && parent != origin {
            results.push("ride".to_owned());
        }
        results.push(direction.as_str().to_owned());
        if child_leads && (!parent_leads || parent == origin) {
            results.push("lead".to_owned());
        }
        if exit.has_flag(ExitFlag::Door) {
            let door = if exit.door.is_empty() {
                "exit"
            } else {
                &exit.door
            };
            results.push(format!("open {door} {direction}"));
        }
        current = parent;
    }
    Some(results)
}

/// Compresses a command stack into the conventional speedwalk notation:
/// runs of one direction collapse to `<count><letter>`, other commands stay
/// verbatim, and the room count leads.
pub fn create_speed_walk(commands: &[String]) -> String {
    fn flush(buffer: &mut Vec<Direction>, out: &mut Vec<String>) {
        let mut runs: Vec<(Direction, usize)> = Vec::new();
        for &direction in buffer.iter() {
            match runs.last_mut() {
                Some((last, count)) if *last == direction => *count += 1,
                _ => runs.push((direction, 1)),
            }
        }
        for (direction, count) in runs {
            if count == 1 {
                out.push(direction.letter().to_string());
            } else {
                out.push(format!("{count}{}", direction.letter()));
            }
        }
        buffer.clear();
    }

    let num_rooms = commands
        .iter()
        .filter(|command| command.parse::<Direction>().is_ok())
        .count();
    let mut out = Vec::new();
    let mut buffer = Vec::new();
    // The stack's end is the first command to walk.
    for command in commands.iter().rev() {
        match command.parse::<Direction>() {
            Ok(direction) => buffer.push(direction),
            Err(()) => {
                flush(&mut buffer, &mut out);
                out.push(command.clone());
            }
        }
    }
    flush(&mut buffer, &mut out);
    format!("{num_rooms} rooms. {}", out.join(", "))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::room::ExitDestination;

    fn link(world: &mut World, from: &str, direction: Direction, to: &str) {
        let exit = Exit::new(ExitDestination::Room(to.to_owned()));
        world
            .rooms
            .get_mut(from)
            .unwrap()
            .exits
            .insert(direction, exit);
    }

    fn grid_world() -> World {
        let mut world = World::new();
        for vnum in 0..6 {
            let mut room = Room::new(vnum.to_string());
            room.terrain = Terrain::City;
            room.calculate_cost();
            world.rooms.insert(vnum.to_string(), room);
        }
        world
    }

    #[test]
    fn straight_line_route() {
        let mut world = grid_world();
        link(&mut world, "0", Direction::North, "1");
        link(&mut world, "1", Direction::North, "2");
        let path = path_find(&world, "0", "2", &BTreeSet::new()).unwrap();
        // Walker order: first command at the end.
        assert_eq!(path, vec!["north".to_owned(), "north".to_owned()]);
    }

    #[test]
    fn origin_is_destination() {
        let world = grid_world();
        let path = path_find(&world, "0", "0", &BTreeSet::new()).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn unreachable_destination_is_none() {
        let world = grid_world();
        assert_eq!(path_find(&world, "0", "5", &BTreeSet::new()), None);
    }

    #[test]
    fn undefined_and_death_exits_are_never_taken() {
        let mut world = grid_world();
        world
            .rooms
            .get_mut("0")
            .unwrap()
            .exits
            .insert(Direction::North, Exit::new(ExitDestination::Undefined));
        world
            .rooms
            .get_mut("0")
            .unwrap()
            .exits
            .insert(Direction::East, Exit::new(ExitDestination::Death));
        assert_eq!(path_find(&world, "0", "1", &BTreeSet::new()), None);
    }

    #[test]
    fn door_inserts_open_command() {
        let mut world = grid_world();
        link(&mut world, "0", Direction::North, "1");
        let exit = world
            .rooms
            .get_mut("0")
            .unwrap()
            .exits
            .get_mut(&Direction::North)
            .unwrap();
        exit.exit_flags.insert(ExitFlag::Door);
        exit.door = "gate".to_owned();
        let path = path_find(&world, "0", "1", &BTreeSet::new()).unwrap();
        assert_eq!(
            path,
            vec!["north".to_owned(), "open gate north".to_owned()],
            "walking pops 'open gate north' first, then 'north'"
        );
    }

    #[test]
    fn avoid_flag_reroutes_when_detour_is_cheaper() {
        let mut world = grid_world();
        // Direct: 0 -north-> 3. Detour: 0 -east-> 1 -north-> 2 -west-> 3.
        link(&mut world, "0", Direction::North, "3");
        link(&mut world, "0", Direction::East, "1");
        link(&mut world, "1", Direction::North, "2");
        link(&mut world, "2", Direction::West, "3");
        let without = path_find(&world, "0", "3", &BTreeSet::new()).unwrap();
        assert_eq!(without, vec!["north".to_owned()]);
        world
            .rooms
            .get_mut("0")
            .unwrap()
            .exits
            .get_mut(&Direction::North)
            .unwrap()
            .exit_flags
            .insert(ExitFlag::Avoid);
        let with = path_find(&world, "0", "3", &BTreeSet::new()).unwrap();
        assert_eq!(
            with,
            vec!["west".to_owned(), "north".to_owned(), "east".to_owned()]
        );
    }

    #[test]
    fn avoided_terrain_costs_extra() {
        let mut world = grid_world();
        // Two hops over a road or three through the city; the road wins
        // until a `noroad` run flag penalizes it.
        world.rooms.get_mut("1").unwrap().terrain = Terrain::Road;
        world.rooms.get_mut("1").unwrap().calculate_cost();
        link(&mut world, "0", Direction::East, "1");
        link(&mut world, "1", Direction::East, "2");
        link(&mut world, "0", Direction::South, "3");
        link(&mut world, "3", Direction::East, "4");
        link(&mut world, "4", Direction::North, "2");
        let unflagged = path_find(&world, "0", "2", &BTreeSet::new()).unwrap();
        assert_eq!(unflagged, vec!["east".to_owned(), "east".to_owned()]);
        let avoid = avoid_terrains_from_flags(&["noroad"]);
        let path = path_find(&world, "0", "2", &avoid).unwrap();
        assert_eq!(
            path,
            vec!["north".to_owned(), "east".to_owned(), "south".to_owned()]
        );
    }

    #[test]
    fn lead_and_ride_surround_designated_rooms() {
        let mut world = grid_world();
        let stable = LEAD_BEFORE_ENTERING_VNUMS[0];
        let mut room = Room::new(stable);
        room.terrain = Terrain::City;
        room.calculate_cost();
        world.rooms.insert(stable.to_owned(), room);
        link(&mut world, "0", Direction::North, stable);
        link(&mut world, stable, Direction::North, "2");
        let path = path_find(&world, "0", "2", &BTreeSet::new()).unwrap();
        // Walking order: lead, north, north, ride.
        assert_eq!(
            path,
            vec![
                "ride".to_owned(),
                "north".to_owned(),
                "north".to_owned(),
                "lead".to_owned(),
            ]
        );
    }

    #[test]
    fn speedwalk_compression() {
        let commands: Vec<String> = [
            // Stack order: first command at the end.
            "south", "south", "east", "open door east", "north", "north", "north",
        ]
        .iter()
        .rev()
        .map(|s| (*s).to_string())
        .collect();
        assert_eq!(
            create_speed_walk(&commands),
            "6 rooms. 3n, open door east, e, 2s"
        );
    }

    #[test]
    fn speedwalk_matches_path_directions() {
        let mut world = grid_world();
        link(&mut world, "0", Direction::North, "1");
        link(&mut world, "1", Direction::North, "2");
        let path = path_find(&world, "0", "2", &BTreeSet::new()).unwrap();
        assert_eq!(create_speed_walk(&path), "2 rooms. 2n");
    }
}
