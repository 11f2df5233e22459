//! Dockerfile parsing into typed instruction records

use crate::{config::parse_duration, errors::ImageError, manifest::HealthConfig};
use std::{fmt, io::Read};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FromArgs {
    pub image: String,
    pub name: Option<String>,
    pub platform: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellArgs {
    pub cmdline: Vec<String>,
    /// Shell form: the command line gets prefixed with the image's shell
    pub prepend_shell: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyArgs {
    pub sources: Vec<String>,
    pub dest: String,
    pub from: Option<String>,
    pub chown: Option<String>,
}

/// One parsed Dockerfile instruction
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    From(FromArgs),
    Env(Vec<KeyValue>),
    Label(Vec<KeyValue>),
    Workdir(String),
    Entrypoint(ShellArgs),
    Cmd(ShellArgs),
    Copy(CopyArgs),
    Healthcheck(HealthConfig),
    Other { name: String, raw: String },
}

/// Parse a Dockerfile into its instruction sequence
///
/// Handles comments, blank lines, and backslash continuations. Instruction
/// names are case-insensitive. Anything unknown becomes
/// [Instruction::Other] so the build engine can decide how loud to be.
pub fn parse<R: Read>(mut reader: R) -> Result<Vec<Instruction>, ImageError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let mut instructions = Vec::new();
    for line in logical_lines(&text) {
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line.as_str(), ""),
        };
        let name = word.to_ascii_uppercase();
        let instruction = match name.as_str() {
            "FROM" => parse_from(rest)?,
            "ENV" => Instruction::Env(parse_pairs("ENV", rest)?),
            "LABEL" => Instruction::Label(parse_pairs("LABEL", rest)?),
            "WORKDIR" => {
                if rest.is_empty() {
                    return Err(ImageError::IllegalFormat(
                        "WORKDIR requires a path".to_owned(),
                    ));
                }
                Instruction::Workdir(rest.to_owned())
            }
            "ENTRYPOINT" => Instruction::Entrypoint(parse_shell_args(rest)?),
            "CMD" => Instruction::Cmd(parse_shell_args(rest)?),
            "COPY" => parse_copy(rest)?,
            "HEALTHCHECK" => parse_healthcheck(rest)?,
            _ => Instruction::Other {
                name,
                raw: rest.to_owned(),
            },
        };
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// Join continuation lines and drop comments and blanks
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            // comments may interrupt a continuation
            continue;
        }
        match line.strip_suffix('\\') {
            Some(stripped) => {
                current.push_str(stripped.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                lines.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current.trim_end().to_owned());
    }
    lines
}

/// Split an argument string on whitespace, honoring quotes and escapes
fn tokenize(input: &str) -> Result<Vec<String>, ImageError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        None => {
                            return Err(ImageError::IllegalFormat(format!(
                                "unterminated quote in: {:?}",
                                input
                            )))
                        }
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some(other) => current.push(other),
                    }
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        None => {
                            return Err(ImageError::IllegalFormat(format!(
                                "unterminated quote in: {:?}",
                                input
                            )))
                        }
                        Some('\'') => break,
                        Some(other) => current.push(other),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_from(rest: &str) -> Result<Instruction, ImageError> {
    let tokens = tokenize(rest)?;
    let mut platform = None;
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.peek() {
        if let Some(flag) = token.strip_prefix("--") {
            match flag.split_once('=') {
                Some(("platform", value)) => platform = Some(value.to_owned()),
                _ => {
                    return Err(ImageError::IllegalFormat(format!(
                        "unsupported FROM flag: {}",
                        token
                    )))
                }
            }
            iter.next();
        } else {
            break;
        }
    }
    let image = iter.next().ok_or_else(|| {
        ImageError::IllegalFormat("FROM requires an image reference".to_owned())
    })?;
    let name = match iter.next() {
        None => None,
        Some(word) if word.eq_ignore_ascii_case("as") => Some(iter.next().ok_or_else(|| {
            ImageError::IllegalFormat("FROM ... AS requires a stage name".to_owned())
        })?),
        Some(word) => {
            return Err(ImageError::IllegalFormat(format!(
                "unexpected FROM argument: {}",
                word
            )))
        }
    };
    if iter.next().is_some() {
        return Err(ImageError::IllegalFormat(format!(
            "trailing FROM arguments: {}",
            rest
        )));
    }
    Ok(Instruction::From(FromArgs {
        image,
        name,
        platform,
    }))
}

fn parse_pairs(name: &str, rest: &str) -> Result<Vec<KeyValue>, ImageError> {
    let tokens = tokenize(rest)?;
    if tokens.is_empty() {
        return Err(ImageError::IllegalFormat(format!(
            "{} requires arguments",
            name
        )));
    }
    if tokens[0].contains('=') {
        tokens
            .iter()
            .map(|token| match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok(KeyValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }),
                _ => Err(ImageError::IllegalFormat(format!(
                    "{} expects key=value, found: {:?}",
                    name, token
                ))),
            })
            .collect()
    } else {
        // legacy space-separated form sets a single key
        if tokens.len() < 2 {
            return Err(ImageError::IllegalFormat(format!(
                "{} expects a key and a value: {:?}",
                name, rest
            )));
        }
        Ok(vec![KeyValue {
            key: tokens[0].clone(),
            value: tokens[1..].join(" "),
        }])
    }
}

fn parse_shell_args(rest: &str) -> Result<ShellArgs, ImageError> {
    let trimmed = rest.trim();
    if trimmed.starts_with('[') {
        let cmdline: Vec<String> = serde_json::from_str(trimmed).map_err(|_| {
            ImageError::IllegalFormat(format!("invalid exec form: {:?}", trimmed))
        })?;
        Ok(ShellArgs {
            cmdline,
            prepend_shell: false,
        })
    } else {
        Ok(ShellArgs {
            cmdline: vec![trimmed.to_owned()],
            prepend_shell: true,
        })
    }
}

fn parse_copy(rest: &str) -> Result<Instruction, ImageError> {
    let tokens = tokenize(rest)?;
    let mut from = None;
    let mut chown = None;
    let mut paths = Vec::new();
    for token in tokens {
        if let Some(flag) = token.strip_prefix("--") {
            if !paths.is_empty() {
                return Err(ImageError::IllegalFormat(format!(
                    "COPY flags must come before paths: {}",
                    token
                )));
            }
            match flag.split_once('=') {
                Some(("from", value)) => from = Some(value.to_owned()),
                Some(("chown", value)) => chown = Some(value.to_owned()),
                _ => {
                    return Err(ImageError::IllegalFormat(format!(
                        "unsupported COPY flag: --{}",
                        flag
                    )))
                }
            }
        } else {
            paths.push(token);
        }
    }
    if paths.len() < 2 {
        return Err(ImageError::IllegalFormat(
            "COPY requires at least one source and a destination".to_owned(),
        ));
    }
    let dest = paths.pop().unwrap_or_default();
    Ok(Instruction::Copy(CopyArgs {
        sources: paths,
        dest,
        from,
        chown,
    }))
}

fn parse_healthcheck(rest: &str) -> Result<Instruction, ImageError> {
    let mut health = HealthConfig::default();
    let mut rest = rest.trim();
    while rest.starts_with("--") {
        let (flag, tail) = match rest.split_once(char::is_whitespace) {
            Some((flag, tail)) => (flag, tail.trim_start()),
            None => (rest, ""),
        };
        match flag.trim_start_matches("--").split_once('=') {
            Some(("interval", value)) => {
                health.interval = parse_duration(value)?.as_nanos() as i64
            }
            Some(("timeout", value)) => health.timeout = parse_duration(value)?.as_nanos() as i64,
            Some(("start-period", value)) => {
                health.start_period = parse_duration(value)?.as_nanos() as i64
            }
            Some(("retries", value)) => {
                health.retries = value.parse().map_err(|_| {
                    ImageError::IllegalFormat(format!("invalid --retries: {:?}", value))
                })?
            }
            _ => {
                return Err(ImageError::IllegalFormat(format!(
                    "unsupported HEALTHCHECK flag: {}",
                    flag
                )))
            }
        }
        rest = tail;
    }

    let (word, tail) = match rest.split_once(char::is_whitespace) {
        Some((word, tail)) => (word, tail.trim()),
        None => (rest, ""),
    };
    if word.eq_ignore_ascii_case("none") {
        health.test = vec!["NONE".to_owned()];
        return Ok(Instruction::Healthcheck(health));
    }
    if !word.eq_ignore_ascii_case("cmd") {
        return Err(ImageError::IllegalFormat(format!(
            "HEALTHCHECK expects CMD or NONE, found: {:?}",
            rest
        )));
    }
    let args = parse_shell_args(tail)?;
    health.test = if args.prepend_shell {
        vec!["CMD-SHELL".to_owned(), tail.to_owned()]
    } else {
        let mut test = vec!["CMD".to_owned()];
        test.extend(args.cmdline);
        test
    };
    Ok(Instruction::Healthcheck(health))
}

impl fmt::Display for Instruction {
    /// Approximate source text, recorded in image history
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn pairs(f: &mut fmt::Formatter<'_>, name: &str, list: &[KeyValue]) -> fmt::Result {
            write!(f, "{}", name)?;
            for pair in list {
                write!(f, " {}={}", pair.key, pair.value)?;
            }
            Ok(())
        }
        fn shell(f: &mut fmt::Formatter<'_>, name: &str, args: &ShellArgs) -> fmt::Result {
            if args.prepend_shell {
                write!(f, "{} {}", name, args.cmdline.join(" "))
            } else {
                let exec = serde_json::to_string(&args.cmdline).map_err(|_| fmt::Error)?;
                write!(f, "{} {}", name, exec)
            }
        }

        match self {
            Instruction::From(from) => {
                write!(f, "FROM")?;
                if let Some(platform) = &from.platform {
                    write!(f, " --platform={}", platform)?;
                }
                write!(f, " {}", from.image)?;
                if let Some(name) = &from.name {
                    write!(f, " AS {}", name)?;
                }
                Ok(())
            }
            Instruction::Env(list) => pairs(f, "ENV", list),
            Instruction::Label(list) => pairs(f, "LABEL", list),
            Instruction::Workdir(path) => write!(f, "WORKDIR {}", path),
            Instruction::Entrypoint(args) => shell(f, "ENTRYPOINT", args),
            Instruction::Cmd(args) => shell(f, "CMD", args),
            Instruction::Copy(copy) => {
                write!(f, "COPY")?;
                if let Some(chown) = &copy.chown {
                    write!(f, " --chown={}", chown)?;
                }
                if let Some(from) = &copy.from {
                    write!(f, " --from={}", from)?;
                }
                for source in &copy.sources {
                    write!(f, " {}", source)?;
                }
                write!(f, " {}", copy.dest)
            }
            Instruction::Healthcheck(health) => {
                write!(f, "HEALTHCHECK {}", health.test.join(" "))
            }
            Instruction::Other { name, raw } => {
                if raw.is_empty() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{} {}", name, raw)
                }
            }
        }
    }
}
