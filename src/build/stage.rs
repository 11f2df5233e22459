//! Multi-stage splitting and build target resolution

use crate::{
    build::dockerfile::{FromArgs, Instruction},
    errors::ImageError,
};

/// A contiguous run of instructions introduced by one `FROM`
#[derive(Clone, Debug)]
pub struct Stage {
    pub name: Option<String>,
    pub base: String,
    pub platform: Option<String>,
    pub commands: Vec<Instruction>,
}

/// The merged command sequence for a selected target stage
#[derive(Clone, Debug)]
pub struct ResolvedTarget {
    /// Base image of the chain's earliest stage, or `scratch`
    pub base: String,
    pub platform: Option<String>,
    pub commands: Vec<Instruction>,
}

/// Split a parsed Dockerfile into stages on each `FROM`
pub fn split_stages(instructions: Vec<Instruction>) -> Result<Vec<Stage>, ImageError> {
    let mut stages: Vec<Stage> = Vec::new();
    for instruction in instructions {
        match instruction {
            Instruction::From(FromArgs {
                image,
                name,
                platform,
            }) => stages.push(Stage {
                name,
                base: image,
                platform,
                commands: Vec::new(),
            }),
            other => match stages.last_mut() {
                Some(stage) => stage.commands.push(other),
                None => {
                    return Err(ImageError::IllegalFormat(format!(
                        "instruction before the first FROM: {}",
                        other
                    )))
                }
            },
        }
    }
    Ok(stages)
}

/// Select the target stage and merge its base chain into one sequence
///
/// The stage list is consumed: each walk truncates it before the matched
/// stage, which also makes the last stage win when names repeat. The chain
/// follows stage-name bases backwards until a base names a real image, and
/// the merged commands run earliest stage first.
pub fn select_target(
    mut stages: Vec<Stage>,
    target: Option<&str>,
) -> Result<ResolvedTarget, ImageError> {
    if stages.is_empty() {
        return Err(ImageError::IllegalFormat(
            "Dockerfile contains no stages".to_owned(),
        ));
    }
    let mut index = match target {
        Some(target) => stages
            .iter()
            .rposition(|stage| stage.name.as_deref() == Some(target))
            .ok_or_else(|| {
                ImageError::IllegalArgument(format!("build target not found: {}", target))
            })?,
        None => stages.len() - 1,
    };

    let mut chain: Vec<Stage> = Vec::new();
    loop {
        stages.truncate(index + 1);
        let stage = match stages.pop() {
            Some(stage) => stage,
            None => break,
        };
        let base = stage.base.clone();
        chain.push(stage);
        match stages
            .iter()
            .rposition(|stage| stage.name.as_deref() == Some(base.as_str()))
        {
            Some(found) => index = found,
            None => break,
        }
    }
    chain.reverse();

    let first = match chain.first() {
        Some(first) => first,
        None => {
            return Err(ImageError::IllegalState(
                "empty build chain after target selection".to_owned(),
            ))
        }
    };
    Ok(ResolvedTarget {
        base: first.base.clone(),
        platform: first.platform.clone(),
        commands: chain.iter().flat_map(|stage| stage.commands.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::dockerfile::parse;

    fn resolve(dockerfile: &str, target: Option<&str>) -> ResolvedTarget {
        let stages = split_stages(parse(dockerfile.as_bytes()).unwrap()).unwrap();
        select_target(stages, target).unwrap()
    }

    const MULTI_STAGE: &str = "\
FROM alpine:latest AS base
ENV A=1
FROM base AS final
ENV B=2
";

    #[test]
    fn last_stage_is_the_default_target() {
        let resolved = resolve(MULTI_STAGE, None);
        assert_eq!(resolved.base, "alpine:latest");
        let rendered: Vec<String> = resolved.commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["ENV A=1", "ENV B=2"]);
    }

    #[test]
    fn explicit_targets_cut_the_chain() {
        let resolved = resolve(MULTI_STAGE, Some("final"));
        let rendered: Vec<String> = resolved.commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["ENV A=1", "ENV B=2"]);

        let resolved = resolve(MULTI_STAGE, Some("base"));
        let rendered: Vec<String> = resolved.commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["ENV A=1"]);
    }

    #[test]
    fn unrelated_stages_are_not_merged() {
        let resolved = resolve(
            "FROM alpine AS builder\nENV TOOL=1\nFROM scratch\nENV APP=1\n",
            None,
        );
        assert_eq!(resolved.base, "scratch");
        let rendered: Vec<String> = resolved.commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["ENV APP=1"]);
    }

    #[test]
    fn duplicate_stage_names_last_one_wins() {
        let resolved = resolve(
            "FROM alpine AS app\nENV FIRST=1\nFROM busybox AS app\nENV SECOND=1\nFROM app\nENV C=1\n",
            None,
        );
        assert_eq!(resolved.base, "busybox");
        let rendered: Vec<String> = resolved.commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["ENV SECOND=1", "ENV C=1"]);
    }

    #[test]
    fn missing_target_fails() {
        let stages = split_stages(parse(MULTI_STAGE.as_bytes()).unwrap()).unwrap();
        assert!(matches!(
            select_target(stages, Some("ghost")),
            Err(ImageError::IllegalArgument(_))
        ));
    }

    #[test]
    fn instructions_before_from_fail() {
        assert!(split_stages(parse("ENV A=1\nFROM scratch\n".as_bytes()).unwrap()).is_err());
    }

    #[test]
    fn platform_comes_from_the_chain_root() {
        let resolved = resolve(
            "FROM --platform=linux/arm64 alpine AS base\nFROM base\nENV X=1\n",
            None,
        );
        assert_eq!(resolved.platform.as_deref(), Some("linux/arm64"));
    }
}
