// ============================================================================
// Strata CLI: headless project inspection and export
// ============================================================================
//
// Usage examples:
//   strata --input sketch.json --info
//   strata --input sketch.json --output flat.png        (composite export)
//   strata --input legacy-v1.json --output sketch.json  (re-encode as v2)
//   strata --new 800x600 --output blank.json
//
// All processing runs synchronously on the current thread.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::project::Project;

/// Strata headless project tool.
///
/// Load a project document, print its layer table, export the composited
/// image as PNG, or re-encode it as a current-version document, all without a GUI.
#[derive(Parser, Debug)]
#[command(
    name = "strata",
    about = "Strata headless project inspector and exporter",
    long_about = "Inspect and convert Strata project documents without opening a GUI.\n\n\
                  Example:\n  \
                  strata --input sketch.json --info\n  \
                  strata --input sketch.json --output flat.png\n  \
                  strata --new 800x600 --output blank.json"
)]
pub struct CliArgs {
    /// Project document to load (v1 or v2 JSON).
    #[arg(short, long, value_name = "DOC.json", conflicts_with = "new")]
    pub input: Option<PathBuf>,

    /// Create a blank project of the given size instead of loading one.
    #[arg(long, value_name = "WxH")]
    pub new: Option<String>,

    /// Output path. `.png` exports the composited image; `.json` writes a
    /// v2 project document.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print canvas and layer information.
    #[arg(long, default_value_t = false)]
    pub info: bool,
}

pub fn run(args: CliArgs) -> ExitCode {
    match run_inner(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run_inner(args: CliArgs) -> Result<(), String> {
    let project = load_project(&args)?;

    if args.info {
        print_info(&project);
    }

    if let Some(output) = &args.output {
        write_output(&project, output)?;
        println!("wrote {}", output.display());
    } else if !args.info {
        return Err("nothing to do: pass --info and/or --output (see --help)".to_string());
    }

    Ok(())
}

fn load_project(args: &CliArgs) -> Result<Project, String> {
    if let Some(input) = &args.input {
        let text = std::fs::read_to_string(input)
            .map_err(|e| format!("cannot read {}: {e}", input.display()))?;
        let project = Project::from_document(&text)
            .map_err(|e| format!("cannot load {}: {e}", input.display()))?;
        crate::log_info!("loaded {}", input.display());
        return Ok(project);
    }
    if let Some(size) = &args.new {
        let (width, height) = parse_size(size)?;
        return Ok(Project::new(width, height));
    }
    Err("pass --input DOC.json or --new WxH".to_string())
}

/// Parse a `WxH` size argument such as `800x600`.
fn parse_size(text: &str) -> Result<(u32, u32), String> {
    let invalid = || format!("invalid size '{text}', expected WxH (e.g. 800x600)");
    let (w, h) = text.split_once(['x', 'X']).ok_or_else(|| invalid())?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

fn print_info(project: &Project) {
    let canvas = project.canvas();
    println!("canvas: {}x{}", canvas.width, canvas.height);
    println!("tool: {}, brush size {}", project.settings.tool.doc_name(), project.settings.brush_size);
    println!("layers (top to bottom):");
    for layer in &canvas.layers {
        let marker = if layer.id == canvas.active_layer { "*" } else { " " };
        let hidden = if layer.visible { "" } else { "  [hidden]" };
        println!(
            "  {marker} {}  opacity {:.2}{hidden}",
            layer.name, layer.opacity
        );
    }
}

fn write_output(project: &Project, output: &PathBuf) -> Result<(), String> {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => {
            let bytes = project
                .export_composite_png()
                .map_err(|e| format!("PNG export failed: {e}"))?;
            std::fs::write(output, bytes)
                .map_err(|e| format!("cannot write {}: {e}", output.display()))
        }
        "json" => {
            let text = project
                .export_project()
                .map_err(|e| format!("document export failed: {e}"))?;
            std::fs::write(output, text)
                .map_err(|e| format!("cannot write {}: {e}", output.display()))
        }
        other => Err(format!(
            "unsupported output extension '{other}': use .png or .json"
        )),
    }
}
