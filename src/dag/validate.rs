//! Structural validation of a loaded DAG definition.
//!
//! All violations are reported with the source line of the offending id so
//! the user can jump straight to the definition file. Validation runs before
//! any side effects; a DAG that fails here never touches git or the state
//! directory.

use anyhow::Result;
use std::collections::{HashMap, HashSet};

use super::parse::Document;

/// Validate the definition half of a document.
///
/// Checks, in order: schema version, non-empty dag name, unique layer ids,
/// unique spec ids, known layer dependencies, known spec dependencies, and
/// an acyclic spec dependency closure.
pub fn validate(doc: &Document) -> Result<()> {
    validate_schema_version(doc)?;

    if doc.dag.meta.name.trim().is_empty() && doc.dag.meta.id.is_none() {
        anyhow::bail!(
            "Invalid DAG definition at {}: dag.name must not be empty (or set dag.id)",
            doc.path.display()
        );
    }

    let mut layer_ids = HashSet::new();
    for layer in &doc.dag.layers {
        if layer.id.trim().is_empty() {
            anyhow::bail!("{}: layer id must not be empty", doc.path.display());
        }
        if !layer_ids.insert(layer.id.as_str()) {
            anyhow::bail!("{}: duplicate layer id '{}'", at(doc, &layer.id), layer.id);
        }
    }

    let mut spec_ids = HashSet::new();
    for feature in doc.dag.features() {
        if feature.id.trim().is_empty() {
            anyhow::bail!("{}: spec id must not be empty", doc.path.display());
        }
        if !spec_ids.insert(feature.id.as_str()) {
            anyhow::bail!(
                "{}: duplicate spec id '{}'",
                at(doc, &feature.id),
                feature.id
            );
        }
    }

    for layer in &doc.dag.layers {
        for dep in &layer.depends_on {
            if !layer_ids.contains(dep.as_str()) {
                anyhow::bail!(
                    "{}: layer '{}' depends on unknown layer '{}'",
                    at(doc, &layer.id),
                    layer.id,
                    dep
                );
            }
        }
    }

    for feature in doc.dag.features() {
        for dep in &feature.depends_on {
            if !spec_ids.contains(dep.as_str()) {
                anyhow::bail!(
                    "{}: spec '{}' depends on unknown spec '{}'",
                    at(doc, &feature.id),
                    feature.id,
                    dep
                );
            }
        }
    }

    check_acyclic(doc)?;
    Ok(())
}

fn validate_schema_version(doc: &Document) -> Result<()> {
    let major = doc
        .schema_version
        .split('.')
        .next()
        .unwrap_or_default()
        .trim();
    if major != "1" {
        anyhow::bail!(
            "{}: unsupported schema_version '{}' (expected 1)",
            doc.path.display(),
            doc.schema_version
        );
    }
    Ok(())
}

/// `file:line` prefix for an id, falling back to the bare path.
fn at(doc: &Document, id: &str) -> String {
    match doc.line_of(id) {
        Some(line) => format!("{}:{}", doc.path.display(), line),
        None => doc.path.display().to_string(),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Detect cycles in the spec dependency closure with a DFS over explicit
/// `depends_on` edges.
fn check_acyclic(doc: &Document) -> Result<()> {
    let deps: HashMap<&str, &[String]> = doc
        .dag
        .features()
        .map(|f| (f.id.as_str(), f.depends_on.as_slice()))
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for feature in doc.dag.features() {
        visit(doc, feature.id.as_str(), &deps, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

fn visit<'a>(
    doc: &Document,
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Result<()> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let cycle_start = stack.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<&str> = stack[cycle_start..].to_vec();
            cycle.push(id);
            anyhow::bail!(
                "{}: dependency cycle: {}",
                at(doc, id),
                cycle.join(" -> ")
            );
        }
        None => {}
    }

    marks.insert(id, Mark::Visiting);
    stack.push(id);
    if let Some(dep_ids) = deps.get(id) {
        for dep in dep_ids.iter() {
            // Unknown deps were already reported; skip here
            if deps.contains_key(dep.as_str()) {
                visit(doc, dep.as_str(), deps, marks, stack)?;
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}
