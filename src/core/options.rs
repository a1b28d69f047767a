//! Declarative option binding.
//!
//! Stages declare the flags they need as static [`OptDef`] tables; the
//! parser for a run is derived from the selected method's stages, so an
//! operator running a three-stage subset is never asked for flags only
//! excluded stages require.
//!
//! Parsing is two-phase: a discovery pass over the full registry picks the
//! method and stage selection, then a method-specific pass accepts exactly
//! the selected stages' flags, turning flags without defaults into required
//! ones. `--config FILE` replaces the whole command line with the fields of
//! a JSON object, tokenised as if they had been given as arguments.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use clap::builder::PossibleValuesParser;
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;

use crate::core::lock::LockSpec;
use crate::core::method::Method;
use crate::error::{Error, Result};

/// How a flag collects values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptKind {
    /// One value, later occurrences override.
    Single,
    /// Repeatable, collected into a list; defaults to the empty list.
    Append,
}

/// One stage-contributed flag.
#[derive(Clone, Copy, Debug)]
pub struct OptDef {
    /// Flag name without dashes; single-character names are short flags.
    pub flag: &'static str,
    pub metavar: &'static str,
    pub help: &'static str,
    pub kind: OptKind,
    pub default: Option<&'static str>,
    /// Whether the flag becomes required once a stage needing it is
    /// selected.
    pub required: bool,
}

impl OptDef {
    pub const fn single(flag: &'static str, metavar: &'static str, help: &'static str) -> Self {
        OptDef {
            flag,
            metavar,
            help,
            kind: OptKind::Single,
            default: None,
            required: true,
        }
    }

    pub const fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub const fn append(flag: &'static str, metavar: &'static str, help: &'static str) -> Self {
        OptDef {
            flag,
            metavar,
            help,
            kind: OptKind::Append,
            default: None,
            required: false,
        }
    }
}

fn to_arg(def: &OptDef, enforce_required: bool) -> Arg {
    let mut arg = Arg::new(def.flag)
        .value_name(def.metavar)
        .help(def.help);
    arg = if def.flag.len() == 1 {
        arg.short(def.flag.chars().next().unwrap_or('?'))
    } else {
        arg.long(def.flag)
    };
    match def.kind {
        OptKind::Single => {
            arg = arg.action(ArgAction::Set);
            if let Some(default) = def.default {
                arg = arg.default_value(default);
            }
            if enforce_required && def.required {
                arg = arg.required(true);
            }
        }
        OptKind::Append => {
            arg = arg.action(ArgAction::Append);
        }
    }
    arg
}

fn base_command(method_names: Vec<&'static str>) -> Command {
    Command::new("praetor")
        .about("Deploy some machines")
        .no_binary_name(true)
        .arg(
            Arg::new("m")
                .short('m')
                .value_name("METHOD")
                .help("Deploy method")
                .required(true)
                .value_parser(PossibleValuesParser::new(method_names)),
        )
        .arg(
            Arg::new("s")
                .short('s')
                .value_name("NUM")
                .num_args(0..)
                .action(ArgAction::Append)
                .help("Explicitly choose method stages by index. Use empty value to list"),
        )
        .arg(
            Arg::new("H")
                .short('H')
                .value_name("HOST")
                .action(ArgAction::Append)
                .help("Host(s) to deploy"),
        )
        .arg(
            Arg::new("g")
                .short('g')
                .value_name("GROUP")
                .action(ArgAction::Append)
                .help("Group(s) to deploy"),
        )
        .arg(
            Arg::new("lock")
                .long("lock")
                .value_name("PATH[,r]")
                .action(ArgAction::Append)
                .help(
                    "Lock specified file while running deploy. Use exclusive lock by \
                     default, shared lock can be specified by appending \",r\" to file name",
                ),
        )
        .arg(
            Arg::new("C")
                .short('C')
                .action(ArgAction::SetTrue)
                .help("Colored log output"),
        )
        .arg(
            Arg::new("r")
                .short('r')
                .value_name("ADDRESS")
                .action(ArgAction::Append)
                .help("address(es) to send e-mail with report to"),
        )
}

/// Rewrite single-dash multi-character flags (`-ll`) into the long form
/// clap understands (`--ll`). Only names present in the registry are
/// touched, so values like `-5` or stage ranges are left alone.
fn normalize_argv(raw: &[String], defs: &[OptDef]) -> Vec<String> {
    let long_flags: Vec<&str> = defs
        .iter()
        .filter(|def| def.flag.len() > 1)
        .map(|def| def.flag)
        .collect();
    raw.iter()
        .map(|token| {
            if let Some(body) = token.strip_prefix('-') {
                if !body.starts_with('-') {
                    let name = body.split('=').next().unwrap_or(body);
                    if long_flags.contains(&name) {
                        return format!("-{token}");
                    }
                }
            }
            token.clone()
        })
        .collect()
}

fn union_registry(methods: &[Method]) -> Vec<OptDef> {
    let mut seen = Vec::new();
    let mut result = Vec::new();
    for method in methods {
        for def in method.required_options() {
            if !seen.contains(&def.flag) {
                seen.push(def.flag);
                result.push(def);
            }
        }
    }
    result
}

fn run_parser(command: Command, argv: &[String]) -> Result<ArgMatches> {
    command.try_get_matches_from(argv).map_err(|err| {
        if err.kind() == clap::error::ErrorKind::DisplayHelp {
            let _ = err.print();
            std::process::exit(0);
        }
        Error::setup(err.to_string())
    })
}

/// Parse `N` and `N-M` stage selectors into an index list.
pub fn parse_selection(specs: &[String]) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for spec in specs {
        match spec.split_once('-') {
            Some((left, right)) => {
                let start: usize = left
                    .parse()
                    .map_err(|_| Error::setup(format!("bad stage range: {spec}")))?;
                let end: usize = right
                    .parse()
                    .map_err(|_| Error::setup(format!("bad stage range: {spec}")))?;
                if end < start {
                    return Err(Error::setup(format!("bad stage range: {spec}")));
                }
                indices.extend(start..=end);
            }
            None => indices.push(
                spec.parse()
                    .map_err(|_| Error::setup(format!("bad stage index: {spec}")))?,
            ),
        }
    }
    Ok(indices)
}

/// Result of the discovery parse.
pub enum Discovery {
    /// `-s` was given with no values: print the method's stage list.
    ListStages { method: usize },
    /// Run the method, optionally restricted to the selected stage indices.
    Run {
        method: usize,
        selection: Option<Vec<usize>>,
    },
}

/// Discovery phase: parse with every registered flag accepted (nothing
/// stage-specific required yet) to learn the method and stage selection.
pub fn discover(raw: &[String], methods: &[Method]) -> Result<Discovery> {
    let registry = union_registry(methods);
    let argv = normalize_argv(raw, &registry);

    let mut command = base_command(methods.iter().map(|m| m.name).collect());
    for def in &registry {
        command = command.arg(to_arg(def, false));
    }

    let matches = run_parser(command, &argv)?;
    let name = matches
        .get_one::<String>("m")
        .ok_or_else(|| Error::setup("a deploy method is required"))?;
    let method = methods
        .iter()
        .position(|m| m.name == name.as_str())
        .ok_or_else(|| Error::setup(format!("unknown method \"{name}\"")))?;

    if matches.value_source("s") != Some(ValueSource::CommandLine) {
        return Ok(Discovery::Run {
            method,
            selection: None,
        });
    }

    let specs: Vec<String> = matches
        .get_many::<String>("s")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if specs.is_empty() {
        return Ok(Discovery::ListStages { method });
    }
    Ok(Discovery::Run {
        method,
        selection: Some(parse_selection(&specs)?),
    })
}

enum ArgValue {
    One(String),
    Many(Vec<String>),
}

/// Parsed argument namespace for one run.
pub struct Parsed {
    pub method: String,
    pub hosts: Vec<String>,
    pub groups: Vec<String>,
    pub locks: Vec<LockSpec>,
    pub colored: bool,
    pub report: Vec<String>,
    values: BTreeMap<String, ArgValue>,
}

impl Parsed {
    pub fn opt_one(&self, flag: &str) -> Option<&str> {
        match self.values.get(flag) {
            Some(ArgValue::One(value)) => Some(value),
            _ => None,
        }
    }

    pub fn one(&self, flag: &str) -> Result<&str> {
        self.opt_one(flag)
            .ok_or_else(|| Error::setup(format!("missing value for option -{flag}")))
    }

    pub fn many(&self, flag: &str) -> Vec<String> {
        match self.values.get(flag) {
            Some(ArgValue::Many(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    pub fn int(&self, flag: &str) -> Result<i64> {
        let value = self.one(flag)?;
        value
            .parse()
            .map_err(|_| Error::setup(format!("option -{flag} expects an integer, got {value}")))
    }
}

fn collect_many(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

/// Method-specific phase: parse with exactly the selected stages' flags;
/// flags without defaults become required.
pub fn parse_for(raw: &[String], method: &Method) -> Result<Parsed> {
    let defs = method.required_options();
    let argv = normalize_argv(raw, &defs);

    let mut command = base_command(vec![method.name]);
    for def in &defs {
        command = command.arg(to_arg(def, true));
    }
    let matches = run_parser(command, &argv)?;

    let mut values = BTreeMap::new();
    for def in &defs {
        match def.kind {
            OptKind::Single => {
                if let Some(value) = matches.get_one::<String>(def.flag) {
                    values.insert(def.flag.to_string(), ArgValue::One(value.clone()));
                }
            }
            OptKind::Append => {
                values.insert(
                    def.flag.to_string(),
                    ArgValue::Many(collect_many(&matches, def.flag)),
                );
            }
        }
    }

    Ok(Parsed {
        method: matches
            .get_one::<String>("m")
            .cloned()
            .unwrap_or_else(|| method.name.to_string()),
        hosts: collect_many(&matches, "H"),
        groups: collect_many(&matches, "g"),
        locks: collect_many(&matches, "lock")
            .iter()
            .map(|value| LockSpec::parse(value))
            .collect(),
        colored: matches.get_flag("C"),
        report: collect_many(&matches, "r"),
        values,
    })
}

/// Replace the command line with the contents of a `--config` JSON file, if
/// one was given. `--config` tolerates no other flags.
pub fn effective_args(raw: Vec<String>) -> Result<Vec<String>> {
    let has_config = raw
        .iter()
        .any(|token| token == "--config" || token.starts_with("--config="));
    if !has_config {
        return Ok(raw);
    }

    let path = match raw.as_slice() {
        [flag, path] if flag == "--config" => Path::new(path).to_path_buf(),
        [token] => match token.strip_prefix("--config=") {
            Some(path) => Path::new(path).to_path_buf(),
            None => return Err(Error::setup("--config is not compatible with other options")),
        },
        _ => return Err(Error::setup("--config is not compatible with other options")),
    };

    let contents = fs::read_to_string(&path)
        .map_err(|err| Error::setup(format!("failed to read {}: {err}", path.display())))?;
    let value: Value = serde_json::from_str(&contents).map_err(|err| Error::Json {
        context: format!("config file {}", path.display()),
        source: err,
    })?;
    config_to_args(&value)
}

/// Tokenise the fields of a JSON object into command-line arguments:
/// `{"m": "simple", "H": ["h1"], "C": true}` becomes
/// `-m simple -H h1 -C`.
pub fn config_to_args(value: &Value) -> Result<Vec<String>> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::setup("config file must contain a JSON object"))?;

    let mut args = Vec::new();
    for (key, value) in object {
        let flag = if key.len() == 1 {
            format!("-{key}")
        } else {
            format!("--{key}")
        };
        match value {
            Value::Null => {}
            Value::Bool(true) => args.push(flag),
            Value::Bool(false) => {}
            Value::String(s) => {
                args.push(flag);
                args.push(s.clone());
            }
            Value::Number(n) => {
                args.push(flag);
                args.push(n.to_string());
            }
            Value::Array(items) => {
                if items.is_empty() {
                    args.push(flag);
                } else {
                    for item in items {
                        args.push(flag.clone());
                        match item {
                            Value::String(s) => args.push(s.clone()),
                            Value::Number(n) => args.push(n.to_string()),
                            other => {
                                return Err(Error::setup(format!(
                                    "unsupported config value for {key}: {other}"
                                )));
                            }
                        }
                    }
                }
            }
            other => {
                return Err(Error::setup(format!(
                    "unsupported config value for {key}: {other}"
                )));
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::{SerialStage, StageCore, StageExec};
    use crate::core::state::State;

    struct NeedsUrl;

    impl StageCore for NeedsUrl {
        fn brief(&self) -> &'static str {
            "needs a url"
        }

        fn options(&self) -> Vec<OptDef> {
            vec![OptDef::single("c", "CONFIG", "config API url")
                .with_default("https://urgu.org/config")]
        }
    }

    impl SerialStage for NeedsUrl {
        fn run(&self, _state: &mut State) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct NeedsAddr;

    impl StageCore for NeedsAddr {
        fn brief(&self) -> &'static str {
            "needs a local address"
        }

        fn options(&self) -> Vec<OptDef> {
            vec![
                OptDef::single("l", "ADDR", "Local address"),
                OptDef::single("ll", "LOGIN", "ssh login for Linux").with_default("root"),
                OptDef::single("ns", "SPEED", "Network speed required").with_default("300"),
                OptDef::append("n", "SPEC", "transfer specs"),
            ]
        }
    }

    impl SerialStage for NeedsAddr {
        fn run(&self, _state: &mut State) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn methods() -> Vec<Method> {
        vec![Method::new(
            "simple",
            "method for deploying pre-configured machines",
            vec![
                StageExec::Serial(Box::new(NeedsUrl)),
                StageExec::Serial(Box::new(NeedsAddr)),
            ],
        )]
    }

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn empty_stage_selection_lists_stages() {
        let methods = methods();
        let raw = strings(&["-m", "simple", "-s", "-H", "h1"]);
        // `-H` consumes its own value, so `-s` really is empty.
        match discover(&raw, &methods).unwrap() {
            Discovery::ListStages { method } => assert_eq!(method, 0),
            _ => panic!("expected stage listing"),
        }
    }

    #[test]
    fn selection_parses_indices_and_ranges() {
        assert_eq!(
            parse_selection(&strings(&["0", "2-4", "7"])).unwrap(),
            vec![0, 2, 3, 4, 7]
        );
        assert!(parse_selection(&strings(&["4-2"])).is_err());
        assert!(parse_selection(&strings(&["x"])).is_err());
    }

    #[test]
    fn discovery_accepts_unselected_stage_flags() {
        let methods = methods();
        let raw = strings(&["-m", "simple", "-s", "0", "-l", "10.0.0.1"]);
        match discover(&raw, &methods).unwrap() {
            Discovery::Run { selection, .. } => assert_eq!(selection, Some(vec![0])),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn phase_two_requires_flags_without_defaults() {
        let mut methods = methods();
        let method = methods.remove(0);
        // Full method includes NeedsAddr, whose -l has no default.
        let raw = strings(&["-m", "simple", "-H", "h1"]);
        assert!(parse_for(&raw, &method).is_err());

        let raw = strings(&["-m", "simple", "-H", "h1", "-l", "10.0.0.1"]);
        let parsed = parse_for(&raw, &method).unwrap();
        assert_eq!(parsed.one("l").unwrap(), "10.0.0.1");
        // Defaults materialise without being passed.
        assert_eq!(parsed.one("c").unwrap(), "https://urgu.org/config");
        assert_eq!(parsed.one("ll").unwrap(), "root");
        assert!(parsed.many("n").is_empty());
    }

    #[test]
    fn phase_two_rejects_flags_of_excluded_stages() {
        let mut methods = methods();
        let method = methods.remove(0).select(&[0]).unwrap();
        // Only NeedsUrl selected; -l belongs to the excluded stage.
        let raw = strings(&["-m", "simple", "-H", "h1", "-l", "10.0.0.1"]);
        assert!(parse_for(&raw, &method).is_err());

        let raw = strings(&["-m", "simple", "-H", "h1"]);
        let parsed = parse_for(&raw, &method).unwrap();
        assert_eq!(parsed.hosts, vec!["h1"]);
    }

    #[test]
    fn multichar_single_dash_flags_are_accepted() {
        let mut methods = methods();
        let method = methods.remove(0);
        let raw = strings(&[
            "-m", "simple", "-H", "h1", "-l", "10.0.0.1", "-ll", "deployer",
        ]);
        let parsed = parse_for(&raw, &method).unwrap();
        assert_eq!(parsed.one("ll").unwrap(), "deployer");
    }

    #[test]
    fn config_object_is_equivalent_to_cli_args() {
        let value: Value = serde_json::from_str(
            r#"{"m": "simple", "H": ["h1", "h2"], "l": "10.0.0.1", "C": true, "ns": 300}"#,
        )
        .unwrap();
        let args = config_to_args(&value).unwrap();
        assert_eq!(
            args,
            strings(&[
                "-C", "-H", "h1", "-H", "h2", "-l", "10.0.0.1", "-m", "simple", "--ns", "300",
            ])
        );

        let mut methods = methods();
        let method = methods.remove(0);
        let parsed = parse_for(&args, &method).unwrap();
        assert_eq!(parsed.hosts, vec!["h1", "h2"]);
        assert!(parsed.colored);
        assert_eq!(parsed.one("l").unwrap(), "10.0.0.1");
    }

    #[test]
    fn config_flag_tolerates_no_other_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"m": "simple", "H": ["h1"], "l": "10.0.0.1"}"#).unwrap();

        let raw = strings(&["--config", path.to_str().unwrap()]);
        let args = effective_args(raw).unwrap();
        assert!(args.contains(&"-m".to_string()));

        let raw = strings(&["--config", path.to_str().unwrap(), "-C"]);
        assert!(effective_args(raw).is_err());
    }
}
