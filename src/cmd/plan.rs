//! Manifest inspection commands: `rollout validate` and `rollout plan`.

use anyhow::Result;
use rollout::dag::DagBuilder;
use rollout::filter;
use std::path::Path;

use super::super::ChangeArgs;
use super::{changeset_from_args, load_project_manifest};

pub fn cmd_validate(project_dir: &Path, manifest: &Path) -> Result<()> {
    let manifest = load_project_manifest(project_dir, manifest)?;
    let graph = DagBuilder::new(&manifest).build()?;

    println!(
        "{} {} services, {} databases",
        console::style("Manifest is valid:").green().bold(),
        graph.len(),
        manifest.databases().len()
    );
    println!("Build order: {}", graph.ordered_names().join(" -> "));
    Ok(())
}

pub fn cmd_plan(project_dir: &Path, manifest: &Path, changes: &ChangeArgs) -> Result<()> {
    let manifest = load_project_manifest(project_dir, manifest)?;
    let graph = DagBuilder::new(&manifest).build()?;
    let changeset = changeset_from_args(project_dir, changes)?;

    println!();
    println!("{}", console::style("Deploy plan").bold().cyan());
    println!();

    match &changeset {
        Some(c) => println!("Changed files: {}", c.len()),
        None => println!("Changed files: all (no changeset given)"),
    }
    println!();

    for (i, wave) in graph.compute_waves().iter().enumerate() {
        println!("Wave {}:", i + 1);
        for name in wave {
            let Some(service) = graph.service_by_name(name) else {
                continue;
            };
            let affected = changeset
                .as_ref()
                .is_none_or(|c| filter::affected(service, c.paths()));
            let marker = if affected {
                console::style("build").green()
            } else {
                console::style("reuse").dim()
            };
            let deps: Vec<&str> = graph
                .index(name)
                .map(|idx| {
                    graph
                        .dependencies(idx)
                        .iter()
                        .map(|link| graph.name(link.index))
                        .collect()
                })
                .unwrap_or_default();
            if deps.is_empty() {
                println!("  {:<7} {} ({})", marker, name, service.kind);
            } else {
                println!(
                    "  {:<7} {} ({}) after {}",
                    marker,
                    name,
                    service.kind,
                    deps.join(", ")
                );
            }
        }
    }
    println!();
    println!("Build order: {}", graph.ordered_names().join(" -> "));
    Ok(())
}
