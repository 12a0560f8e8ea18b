use flowfix::graph::{analyze_saved_pipeline, render_analyses};
use std::{env, path::PathBuf, process};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1);
    let mut pipeline_file: Option<PathBuf> = None;
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--pipeline-file" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--pipeline-file requires a path".to_string())?;
                pipeline_file = Some(PathBuf::from(value));
            }
            "--json" => json = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ if pipeline_file.is_none() && !arg.starts_with('-') => {
                pipeline_file = Some(PathBuf::from(arg));
            }
            _ => {
                print_usage();
                return Err(format!("unexpected argument {arg}"));
            }
        }
    }

    let Some(path) = pipeline_file else {
        print_usage();
        return Err("missing --pipeline-file; provide the path to a saved pipeline".into());
    };

    let analyses = analyze_saved_pipeline(&path).map_err(|e| e.to_string())?;
    if json {
        let out = serde_json::to_string_pretty(&analyses).map_err(|e| e.to_string())?;
        println!("{out}");
    } else {
        print!("{}", render_analyses(&analyses));
    }
    Ok(())
}

fn print_usage() {
    eprintln!("Usage: find-nodes [--json] --pipeline-file <saved pipeline json>");
}
