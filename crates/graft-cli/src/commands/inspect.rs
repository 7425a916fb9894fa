//! `graft inspect` command implementation

use crate::error::CliError;
use colored::Colorize;
use graft_kernel::{FieldKind, ModuleManifest, TypeSchema};
use graft_plugins::hot_reload::{DylibSource, ModuleSource};
use std::path::Path;

/// Execute the `graft inspect` command
pub fn run(module: &Path, skip_version_check: bool) -> Result<(), CliError> {
    let source = DylibSource::new(!skip_version_check);
    let loaded = source.open(module)?;

    println!(
        "{} {} v{} ({})",
        "→".green(),
        loaded.manifest().name().bold(),
        loaded.manifest().version(),
        module.display()
    );
    println!("  sha256: {}", loaded.hash().dimmed());
    match loaded.entry_type() {
        Ok(entry) => println!("  entry:  {}", entry.name().cyan()),
        Err(err) => println!("  {} {}", "✗".red(), err),
    }
    println!();

    for line in describe(loaded.manifest()) {
        println!("{line}");
    }
    Ok(())
}

/// Plain-text listing of every published type.
pub fn describe(manifest: &ModuleManifest) -> Vec<String> {
    let mut lines = Vec::new();
    for schema in manifest.types() {
        lines.push(format!("  {}{}", schema.name(), markers(schema)));
        for field in schema.fields() {
            let kind = match field.kind() {
                FieldKind::Object { target } => format!("object -> {}", target().name()),
                other => other.label().to_string(),
            };
            lines.push(format!(
                "    field    {}: {} [{}]",
                field.name(),
                field.type_name(),
                kind
            ));
        }
        for property in schema.properties() {
            lines.push(format!("    property {}", property.name()));
        }
        for command in schema.commands() {
            let debug = if command.debug_only() { " (debug only)" } else { "" };
            lines.push(format!("    command  {}{}", command.name(), debug));
        }
    }
    lines
}

fn markers(schema: &TypeSchema) -> String {
    let mut markers = Vec::new();
    if schema.is_entry() {
        markers.push("entry");
    }
    if schema.is_system() {
        markers.push("system");
    }
    if schema.has_constructor() {
        markers.push("constructor");
    }
    if schema.has_startup() {
        markers.push("startup");
    }
    if schema.implements(graft_kernel::Capability::Hotload) {
        markers.push("on-hotload");
    }
    if markers.is_empty() {
        String::new()
    } else {
        format!(" <{}>", markers.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_kernel::{Handle, reflect};

    #[derive(Default)]
    struct Meter {
        reading: f32,
    }

    reflect!(Meter, |schema| schema
        .value("reading", |m: &Meter| &m.reading, |m: &mut Meter| &mut m.reading)
        .on_hotload(|m: &mut Meter| m.reading = 0.0)
        .build());

    #[derive(Default)]
    struct Panel {
        meter: Option<Handle<Meter>>,
        log: Vec<String>,
    }

    reflect!(Panel, |schema| schema
        .entry()
        .object("meter", |p: &Panel| &p.meter, |p: &mut Panel| &mut p.meter)
        .list("log", |p: &Panel| &p.log, |p: &mut Panel| &mut p.log)
        .command("panel.clear", true, |p: &mut Panel, _args: &[String]| p.log.clear())
        .build());

    #[test]
    fn test_describe_lists_types_fields_and_commands() {
        let manifest = ModuleManifest::new("panel", "0.3.0")
            .with_type::<Panel>()
            .with_type::<Meter>();
        let lines = describe(&manifest);

        assert_eq!(lines[0], "  Panel <entry>");
        assert!(lines[1].starts_with("    field    meter:"));
        assert!(lines[1].ends_with("[object -> Meter]"));
        assert!(lines[2].ends_with("[value list]"));
        assert_eq!(lines[3], "    command  panel.clear (debug only)");
        assert_eq!(lines[4], "  Meter <on-hotload>");
    }
}
