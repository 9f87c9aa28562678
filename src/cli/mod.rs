mod task;

use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;

use clipforge::PipelineConfig;
use clipforge::core::terminal::{self, GuideSection};
use clipforge::logging;

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "--config", "-c", "--db", "--request", "-r", "--prompt", "-p", "--mode", "-m", "--task", "-t",
];

const COMMANDS: &[&str] = &["run", "resume", "inspect", "tasks", "tools"];

fn check_command(cmd: &str) -> Result<()> {
    if !COMMANDS.contains(&cmd) {
        bail!("unknown command '{}'; run 'clipforge help' for usage", cmd);
    }
    Ok(())
}

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Tasks")
        .command("run", "Plan, generate, verify and render a new task")
        .command("resume", "Continue a task from its context log")
        .command("inspect", "Show what a task's context log records")
        .command("tasks", "List tasks in the journal")
        .print();

    GuideSection::new("Setup")
        .command("tools", "List the tools the current config registers")
        .print();

    GuideSection::new("Options")
        .status("--config, -c <file>", "pipeline config (default ./clipforge.toml)")
        .status("--db <file>", "journal database (overrides db_path)")
        .status("--task, -t <id>", "resume/inspect: task id (or pass it positionally)")
        .status("--request, -r <file>", "task request JSON: mode, prompt, assets, ...")
        .status("--prompt, -p <text>", "prompt, when no request file is given")
        .status("--mode, -m <mode>", "fully_generative | semi_generative | pure_editing")
        .status("--json", "print machine-readable output")
        .status("--entries", "inspect: print every context entry")
        .print();

    println!(
        " {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("clipforge").green()
    );
}

pub(crate) fn parse_string_flag(args: &[String], start: usize, names: &[&str]) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

pub(crate) fn has_flag(args: &[String], start: usize, name: &str) -> bool {
    args.iter().skip(start).any(|a| a == name)
}

/// First argument after `start` that is neither a flag nor a flag's value.
pub(crate) fn positional(args: &[String], start: usize) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
        } else if arg.starts_with('-') {
            i += 1;
        } else {
            return Some(arg.to_string());
        }
    }
    None
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }
    check_command(cmd)?;

    let config_path = parse_string_flag(&args, 2, &["--config", "-c"]).map(PathBuf::from);
    let mut config = PipelineConfig::load(config_path.as_deref()).await?;
    if let Some(db) = parse_string_flag(&args, 2, &["--db"]) {
        config.db_path = Some(PathBuf::from(db));
    }
    logging::init_logging(&config.log_level);

    match cmd {
        "run" => task::run(&args, config).await,
        "resume" => task::resume(&args, config).await,
        "inspect" => task::inspect(&args, config).await,
        "tasks" => task::list(config).await,
        "tools" => task::tools(config),
        _ => bail!("unknown command '{}'", cmd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn string_flags_take_the_next_argument() {
        let argv = args(&["clipforge", "run", "-p", "a cafe ad", "--config", "x.toml"]);
        assert_eq!(
            parse_string_flag(&argv, 2, &["--prompt", "-p"]).as_deref(),
            Some("a cafe ad")
        );
        assert_eq!(
            parse_string_flag(&argv, 2, &["--config", "-c"]).as_deref(),
            Some("x.toml")
        );
        assert_eq!(parse_string_flag(&argv, 2, &["--mode"]), None);
    }

    #[test]
    fn positional_skips_flag_values() {
        let argv = args(&["clipforge", "resume", "--config", "x.toml", "--json", "task-1"]);
        assert_eq!(positional(&argv, 2).as_deref(), Some("task-1"));
        assert!(has_flag(&argv, 2, "--json"));
        assert_eq!(positional(&args(&["clipforge", "resume"]), 2), None);

        let argv = args(&["clipforge", "inspect", "--db", "j.db", "-t", "task-2"]);
        assert_eq!(positional(&argv, 2), None);
    }

    #[test]
    fn unknown_commands_are_errors() {
        for cmd in COMMANDS {
            assert!(check_command(cmd).is_ok(), "{cmd}");
        }
        let err = check_command("rnu").unwrap_err();
        assert!(err.to_string().contains("unknown command 'rnu'"));
    }
}
