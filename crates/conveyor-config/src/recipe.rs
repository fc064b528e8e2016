//! Recipe file parsing.

use std::collections::HashMap;
use std::path::Path;

use conveyor_core::recipe::{Cause, RecipeDefinition, RecipeStep, TriggerPolicy};
use kdl::{KdlDocument, KdlNode};
use tracing::debug;

use crate::nodes::{
    all_string_args, bool_arg, bool_prop, env_block, first_string_arg, int_arg,
    required_string_arg,
};
use crate::{ConfigError, ConfigResult};

/// Parse one recipe file. `filename` is the recipe's stable identity and
/// what other recipes name in `depends-on`.
pub fn parse_recipe(kdl: &str, filename: &str) -> ConfigResult<RecipeDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "recipe")
        .ok_or_else(|| ConfigError::MissingField(format!("recipe node in {}", filename)))?;

    let name = required_string_arg(node, "recipe name")?;
    let mut def = RecipeDefinition {
        display_name: name.clone(),
        name,
        filename: filename.to_string(),
        build_user: String::new(),
        repository: String::new(),
        branch: None,
        cause: Cause::PullRequest,
        trigger: TriggerPolicy::FullAuto,
        authorized_users: Vec::new(),
        build_configs: Vec::new(),
        depends_on: Vec::new(),
        priority: 0,
        active: true,
        auto_cancel_on_push: false,
        abort_on_failure: true,
        environment: Vec::new(),
        prestep_sources: Vec::new(),
        steps: Vec::new(),
    };

    let Some(children) = node.children() else {
        return Err(ConfigError::MissingField(format!(
            "body of recipe '{}'",
            def.name
        )));
    };

    for child in children.nodes() {
        match child.name().value() {
            "display-name" => def.display_name = required_string_arg(child, "display-name")?,
            "build-user" => def.build_user = required_string_arg(child, "build-user")?,
            "repository" => def.repository = required_string_arg(child, "repository")?,
            "branch" => def.branch = first_string_arg(child),
            "cause" => {
                let cause = required_string_arg(child, "cause")?;
                def.cause = cause
                    .parse()
                    .map_err(|_| ConfigError::invalid("cause", format!("unknown cause: {}", cause)))?;
            }
            "trigger" => {
                let trigger = required_string_arg(child, "trigger")?;
                def.trigger = trigger.parse().map_err(|_| {
                    ConfigError::invalid("trigger", format!("unknown trigger policy: {}", trigger))
                })?;
            }
            "authorized" => def.authorized_users.extend(all_string_args(child)),
            "configs" => def.build_configs.extend(all_string_args(child)),
            "depends-on" => def.depends_on.extend(all_string_args(child)),
            "priority" => {
                let priority = int_arg(child, "priority")?;
                def.priority = i32::try_from(priority)
                    .map_err(|_| ConfigError::invalid("priority", "out of range"))?;
            }
            "active" => def.active = bool_arg(child, "active")?,
            "auto-cancel-on-push" => {
                def.auto_cancel_on_push = bool_arg(child, "auto-cancel-on-push")?
            }
            "abort-on-failure" => def.abort_on_failure = bool_arg(child, "abort-on-failure")?,
            "env" => def.environment.extend(env_block(child)),
            "prestep" => def.prestep_sources.push(required_string_arg(child, "prestep")?),
            "step" => def.steps.push(parse_step(child)?),
            other => debug!(recipe = %def.name, node = other, "Ignoring unknown recipe node"),
        }
    }

    if def.build_user.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "build-user for recipe '{}'",
            def.name
        )));
    }
    if def.repository.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "repository for recipe '{}'",
            def.name
        )));
    }
    if def.build_configs.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "configs for recipe '{}'",
            def.name
        )));
    }
    if def.steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "at least one step for recipe '{}'",
            def.name
        )));
    }
    if def.depends_on.iter().any(|d| d == filename) {
        return Err(ConfigError::CycleDetected(format!(
            "{} -> {}",
            filename, filename
        )));
    }

    Ok(def)
}

fn parse_step(node: &KdlNode) -> ConfigResult<RecipeStep> {
    let name = required_string_arg(node, "step name")?;
    let mut lines = Vec::new();
    let mut environment = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => lines.extend(all_string_args(child)),
                "env" => environment.extend(env_block(child)),
                _ => {}
            }
        }
    }

    if lines.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run for step '{}'",
            name
        )));
    }

    Ok(RecipeStep {
        name,
        script: lines.join("\n"),
        abort_on_failure: bool_prop(node, "abort-on-failure").unwrap_or(true),
        allowed_to_fail: bool_prop(node, "allowed-to-fail").unwrap_or(false),
        environment,
    })
}

/// Check cross-recipe references: filenames must be unique, every
/// `depends-on` must name a recipe in the set, and the graph must be acyclic.
pub fn validate_recipes(recipes: &[RecipeDefinition]) -> ConfigResult<()> {
    let mut by_filename: HashMap<&str, &RecipeDefinition> = HashMap::new();
    for recipe in recipes {
        if by_filename.insert(recipe.filename.as_str(), recipe).is_some() {
            return Err(ConfigError::Duplicate(recipe.filename.clone()));
        }
    }

    for recipe in recipes {
        for dep in &recipe.depends_on {
            if !by_filename.contains_key(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "recipe '{}' depends on unknown recipe file '{}'",
                    recipe.filename, dep
                )));
            }
        }
    }

    detect_cycle(&by_filename).map_err(ConfigError::CycleDetected)
}

/// Detect cycles in the recipe dependency graph using DFS.
fn detect_cycle(recipes: &HashMap<&str, &RecipeDefinition>) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let mut filenames: Vec<&str> = recipes.keys().copied().collect();
    filenames.sort_unstable();

    for filename in filenames {
        if !visited.contains_key(filename) {
            if let Some(cycle) = dfs_detect_cycle(filename, recipes, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    recipes: &'a HashMap<&'a str, &'a RecipeDefinition>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(recipe) = recipes.get(node) {
        for dep in &recipe.depends_on {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, recipes, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}

/// Load and validate every `*.kdl` recipe file in a directory.
pub fn load_recipe_dir(dir: &Path) -> ConfigResult<Vec<RecipeDefinition>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "kdl") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut recipes = Vec::with_capacity(paths.len());
    for path in paths {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ConfigError::invalid("recipe path", path.display().to_string()))?
            .to_string();
        let text = std::fs::read_to_string(&path)?;
        recipes.push(parse_recipe(&text, &filename)?);
    }

    validate_recipes(&recipes)?;
    Ok(recipes)
}
