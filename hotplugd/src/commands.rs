// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Line commands accepted on stdin.

use anyhow::{anyhow, bail, Context, Result};
use hotplug_core::CoreId;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Display went off.
    Suspend,
    /// Display came back.
    Resume,
    /// Switch the governor on.
    Enable,
    /// Switch the governor off and bring every core online.
    Disable,
    /// Print one tunable.
    Get(String),
    /// Change one tunable.
    Set(String, String),
    /// Print the per-core counters, optionally as JSON.
    Stats { json: bool },
    /// List every tunable with its value.
    Keys,
    /// Simulated backend only: set the run-queue depth.
    Load(u32),
    /// Simulated backend only: set a core's clock rate in kHz.
    Freq(CoreId, u64),
    /// Print the command summary.
    Help,
    /// Stop the daemon.
    Quit,
}

/// Reply to `help`.
pub const HELP: &str = "\
commands:
  suspend | resume         display off / on
  enable | disable         switch the governor
  get <key>                print a tunable
  set <key> <value>        change a tunable
  keys                     list every tunable
  stats [json]             per-core counters
  load <depth>             (simulated) run-queue depth, tenths of a task
  freq <core> <khz>        (simulated) core clock rate
  quit";

/// Parses one line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb, args.as_slice()) {
        ("suspend", []) => Command::Suspend,
        ("resume", []) => Command::Resume,
        ("enable", []) => Command::Enable,
        ("disable", []) => Command::Disable,
        ("get", [key]) => Command::Get(key.to_string()),
        ("set", [key, value]) => Command::Set(key.to_string(), value.to_string()),
        ("keys", []) => Command::Keys,
        ("stats", []) => Command::Stats { json: false },
        ("stats", ["json"]) => Command::Stats { json: true },
        ("load", [depth]) => Command::Load(
            depth
                .parse()
                .with_context(|| format!("invalid queue depth '{depth}'"))?,
        ),
        ("freq", [core, khz]) => Command::Freq(
            core.parse()
                .with_context(|| format!("invalid core '{core}'"))?,
            khz.parse()
                .with_context(|| format!("invalid clock rate '{khz}'"))?,
        ),
        ("help", []) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        ("get" | "set" | "stats" | "load" | "freq", _) => {
            bail!("wrong arguments for '{verb}', try 'help'")
        }
        _ => return Err(anyhow!("unknown command '{verb}', try 'help'")),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(parse("suspend").unwrap(), Some(Command::Suspend));
        assert_eq!(parse("  resume \n").unwrap(), Some(Command::Resume));
        assert_eq!(parse("exit").unwrap(), Some(Command::Quit));
        assert_eq!(
            parse("stats json").unwrap(),
            Some(Command::Stats { json: true })
        );
    }

    #[test]
    fn test_parse_get_and_set() {
        assert_eq!(
            parse("get min_cpus").unwrap(),
            Some(Command::Get("min_cpus".into()))
        );
        assert_eq!(
            parse("set nwns_threshold_0 40").unwrap(),
            Some(Command::Set("nwns_threshold_0".into(), "40".into()))
        );
    }

    #[test]
    fn test_parse_simulation_controls() {
        assert_eq!(parse("load 45").unwrap(), Some(Command::Load(45)));
        assert_eq!(
            parse("freq 2 918000").unwrap(),
            Some(Command::Freq(2, 918_000))
        );
        assert!(parse("load lots").is_err());
    }

    #[test]
    fn test_blank_and_comment_lines_are_skipped() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   # warm up").unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        let err = parse("reboot").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        let err = parse("set delay").unwrap_err();
        assert!(err.to_string().contains("wrong arguments"));
        assert!(parse("suspend now").is_err());
    }
}
