//! Microscope stage - command line control
//!
//! This is the CLI entry point for the microscope stage tool.
//! Run with: cargo run --bin microscope [command]

use anyhow::Context;
use microscope_stage::camera::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use microscope_stage::{
    AppSettings, Datafile, Microscope, MoveOptions, MoveOutcome, Position, Stage, StillCamera,
    TemplateMatcher, Transport,
};
use std::env;
use std::io::{self, BufRead, Write};

type Scope = Microscope<Box<dyn Transport>>;

enum Flow {
    Continue,
    Quit,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    // Saved settings first, environment variables on top
    let mut settings = AppSettings::load();
    settings.apply_env();

    let transport = settings
        .transport_mode()
        .open()
        .context("Failed to open the stage (set STAGE_EMULATE=1 to run without hardware)")?;
    let stage = Stage::with_bound(transport, settings.xyz_bound);

    let camera = if settings.camera_image.is_empty() {
        StillCamera::blank(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    } else {
        StillCamera::open(&settings.camera_image)
            .with_context(|| format!("Failed to load {}", settings.camera_image))?
    };

    let mut scope = Microscope::new(stage, Box::new(camera), Box::new(TemplateMatcher::new()))
        .with_transform(settings.transform);

    let mut datafile = if settings.datafile.is_empty() {
        Datafile::in_dir(".")
    } else {
        Datafile::open(&settings.datafile)?
    };

    println!("🔬 Microscope Stage");
    println!("================================================");
    println!("Stage: {}", scope.stage.version());
    println!("Bound: +/-{} microsteps", scope.stage.bound());
    println!("Transform: {:?}", scope.transform.rows);
    println!(
        "Servo: tolerance {:.2} um at {:.4} um/px, {} moves max",
        settings.servo_tolerance, settings.servo_um_per_pixel, settings.servo_max_iterations
    );
    println!("Datafile: {}", datafile.path().display());
    println!("================================================\n");

    // One-shot command
    if args.len() > 1 {
        let command = args[1..].join(" ");
        if let Err(e) = run_command(&mut scope, &mut settings, &mut datafile, &command) {
            eprintln!("❌ Error: {:#}", e);
        }
        return Ok(());
    }

    println!("Interactive mode. Type 'help' for commands, 'quit' to exit.\n");

    let stdin = io::stdin();
    loop {
        print!("🔬 ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match run_command(&mut scope, &mut settings, &mut datafile, command) {
            Ok(Flow::Quit) => {
                println!("Goodbye! 👋");
                break;
            }
            Ok(Flow::Continue) => {}
            Err(e) => eprintln!("❌ Error: {:#}\n", e),
        }
    }

    Ok(())
}

fn run_command(
    scope: &mut Scope,
    settings: &mut AppSettings,
    datafile: &mut Datafile,
    line: &str,
) -> anyhow::Result<Flow> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Flow::Continue);
    };
    let rest: Vec<&str> = words.collect();

    match command {
        "move" => report(scope.stage.move_rel(parse_vector(&rest)?, MoveOptions::default())?),
        "fast" => report(scope.stage.fast_move(parse_vector(&rest)?, MoveOptions::default())?),
        "goto" => report(scope.stage.move_to_pos(parse_vector(&rest)?, MoveOptions::default())?),
        "focus" => {
            let [z] = parse_numbers::<1>(&rest)?;
            report(scope.stage.focus_rel(z, MoveOptions::default())?);
        }
        "centre" | "center" => report(scope.stage.centre_stage()?),
        "release" => {
            scope.stage.release()?;
            println!("✅ Motors released");
        }
        "pos" => println!("📍 {}", scope.stage.position()),
        "reset" => {
            scope.stage.reset_position();
            println!("📍 Position reset to {}", scope.stage.position());
        }
        "select" => {
            let [x, y, w, h] = parse_numbers::<4>(&rest)?;
            let template = scope.select_region(
                to_pixels(x)?,
                to_pixels(y)?,
                to_pixels(w)?,
                to_pixels(h)?,
            )?;
            println!("🎯 Selected {}x{} template", template.width(), template.height());
        }
        "track" => {
            let run = scope.track_selection(&settings.servo_config())?;
            match run.final_position() {
                Some(p) => println!(
                    "🎯 {:?} after {} moves, template at ({:.1}, {:.1})",
                    run.status(),
                    run.iteration(),
                    p.x,
                    p.y
                ),
                None => println!("⚠️ {:?}, selection cleared", run.status()),
            }
            let group = datafile.new_group("tracking", Some("Centring run"))?;
            datafile.add_data(&group, "run", &run, None)?;
        }
        "calibrate" => {
            let mut config = settings.calibration_config();
            if let Some(d) = rest.first() {
                config = config.with_half_width(d.parse().context("Invalid half width")?);
            }
            println!("🎯 Calibrating with a +/-{} microstep square...", config.half_width);

            let result = scope.calibrate(None, &config)?;
            println!("✅ Calibration complete!");
            println!("   Transform: {:?}", result.transform.rows);
            println!("   Residuals: {:?}", result.residuals);
            println!("   Norm: {:.4}", result.norm);

            scope.transform = result.transform;
            settings.transform = result.transform;
            let group = datafile.new_group("calibration", Some("Camera-to-stage calibration"))?;
            datafile.add_data(&group, "result", &result, None)?;
        }
        "save-settings" => {
            settings.save().map_err(anyhow::Error::msg)?;
            if let Some(path) = AppSettings::settings_path() {
                println!("💾 Settings saved to {}", path.display());
            }
        }
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command '{}'. Type 'help' for commands.", other),
    }

    Ok(Flow::Continue)
}

fn report(outcome: MoveOutcome) {
    match outcome {
        MoveOutcome::Moved { position, .. } => println!("✅ Stage at {}", position),
        MoveOutcome::OutOfBounds { requested, bound } => println!(
            "⚠️ {} is outside +/-{} microsteps, not moved",
            requested, bound
        ),
    }
}

fn parse_vector(words: &[&str]) -> anyhow::Result<Position> {
    let values = words
        .iter()
        .map(|w| w.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .context("Coordinates must be integers")?;
    Ok(Position::from_slice(&values)?)
}

fn parse_numbers<const N: usize>(words: &[&str]) -> anyhow::Result<[i64; N]> {
    if words.len() != N {
        anyhow::bail!("Expected {} numbers, got {}", N, words.len());
    }
    let mut out = [0i64; N];
    for (slot, word) in out.iter_mut().zip(words) {
        *slot = word
            .parse()
            .with_context(|| format!("'{}' is not an integer", word))?;
    }
    Ok(out)
}

fn to_pixels(value: i64) -> anyhow::Result<u32> {
    u32::try_from(value).context("Pixel values must be non-negative")
}

fn print_help() {
    println!("Commands:");
    println!("  move x y z       relative move in microsteps");
    println!("  fast x y z       relative move in whole motor steps");
    println!("  goto x y z       absolute move");
    println!("  focus z          focus move");
    println!("  centre           return to the origin");
    println!("  release          turn the motors off");
    println!("  pos              show the tracked position");
    println!("  reset            call the current position the origin");
    println!("  select x y w h   select a template from the current frame");
    println!("  track            centre the selected template");
    println!("  calibrate [D]    fit the camera-to-stage transform");
    println!("  save-settings    persist the current settings");
    println!("  quit             exit\n");
}
