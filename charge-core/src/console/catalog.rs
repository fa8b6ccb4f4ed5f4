//! Console command table.
//!
//! The parser, `help` output and prefix completion all read the same table
//! so keywords and usage text stay in sync.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Status,
    Help,
    Water,
    Threshold,
    Afc,
    Voltage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub tag: CommandTag,
    pub usage: &'static str,
    pub summary: &'static str,
    /// Keywords accepted directly after the command name.
    pub keywords: &'static [&'static str],
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "status",
        tag: CommandTag::Status,
        usage: "status",
        summary: "show port, water and HV state",
        keywords: &[],
    },
    CommandSpec {
        name: "help",
        tag: CommandTag::Help,
        usage: "help [command]",
        summary: "list commands or describe one",
        keywords: &["status", "water", "threshold", "afc", "voltage"],
    },
    CommandSpec {
        name: "water",
        tag: CommandTag::Water,
        usage: "water check | water wet | water sensitivity low|middle|high",
        summary: "run a water check, start the factory water test or set sensitivity",
        keywords: &["check", "wet", "sensitivity"],
    },
    CommandSpec {
        name: "threshold",
        tag: CommandTag::Threshold,
        usage: "threshold <key>=<value>",
        summary: "adjust a detector threshold",
        keywords: &[
            "wet-kohm-min",
            "wet-kohm-max",
            "dry-kohm-min",
            "wet-mv-max",
            "dry-mv-min",
            "monitor-ms",
            "water1-hold-ms",
        ],
    },
    CommandSpec {
        name: "afc",
        tag: CommandTag::Afc,
        usage: "afc enable|disable",
        summary: "allow or forbid high-voltage negotiation",
        keywords: &["enable", "disable"],
    },
    CommandSpec {
        name: "voltage",
        tag: CommandTag::Voltage,
        usage: "voltage 5|9",
        summary: "request a bus voltage from the charger",
        keywords: &[],
    },
];

/// Looks a command up by name, ignoring ASCII case.
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

/// Candidates for the word being typed at the end of `line`.
///
/// Completes command names for the first word and the command's keywords
/// for the second.
#[must_use]
pub fn complete(line: &str) -> impl Iterator<Item = &'static str> + '_ {
    let trailing_space = line.ends_with([' ', '\t']);
    let mut words = line.split_whitespace();
    let first = words.next().unwrap_or("");
    let second = words.next();
    let extra = words.next().is_some();

    let (pool, prefix): (&'static [&'static str], &str) = match (second, trailing_space, extra) {
        (None, false, false) => (&[], first),
        (None, true, false) | (Some(_), false, false) => {
            let keywords = find(first).map_or(&[][..], |spec| spec.keywords);
            (keywords, second.unwrap_or(""))
        }
        _ => (&[], ""),
    };
    let complete_commands = second.is_none() && !trailing_space;

    let commands = COMMANDS
        .iter()
        .map(|spec| spec.name)
        .filter(move |name| complete_commands && starts_with_ignore_case(name, prefix));
    let keywords = pool
        .iter()
        .copied()
        .filter(move |keyword| starts_with_ignore_case(keyword, prefix));
    commands.chain(keywords)
}

fn starts_with_ignore_case(candidate: &str, prefix: &str) -> bool {
    candidate
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
