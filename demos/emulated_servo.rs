//! Calibrate and centre on a synthetic scene, no hardware needed.
//!
//! Run with: cargo run --example emulated_servo

use image::Luma;
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use microscope_stage::camera::{crop_template, generate_scene};
use microscope_stage::stage::PositionFeed;
use microscope_stage::{
    CalibrationConfig, Datafile, EmulatedTransport, Microscope, ServoConfig, SimulatedCamera,
    Stage, TemplateMatcher,
};
use std::time::Duration;

/// How far features move in the image per microstep of stage travel.
const PIXELS_PER_MICROSTEP: [[f64; 2]; 2] = [[0.2, 0.05], [-0.04, 0.18]];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut scene = generate_scene(800, 600, 42);
    // Landmark seen at frame (200, 120)..(264, 184) with the stage at the origin
    draw_filled_rect_mut(&mut scene, Rect::at(452, 310).of_size(24, 14), Luma([255u8]));
    draw_filled_circle_mut(&mut scene, (470, 340), 6, Luma([180u8]));

    let feed = PositionFeed::default();
    let stage = Stage::new(EmulatedTransport::with_feed(feed.clone()));
    let camera = SimulatedCamera::new(scene, 320, 240, feed, PIXELS_PER_MICROSTEP)?;
    let mut scope = Microscope::new(stage, Box::new(camera), Box::new(TemplateMatcher::new()));

    println!("🔬 Emulated microscope: {}", scope.stage.version());
    println!("Starting transform: {:?}\n", scope.transform.rows);

    let reference = crop_template(&scope.capture()?, 200, 120, 64, 64)?;
    let calibration_config = CalibrationConfig::default().with_settle(Duration::ZERO);
    let calibration = scope.calibrate(Some(&reference), &calibration_config)?;
    println!("🎯 Calibrated transform: {:?}", calibration.transform.rows);
    println!("   Residuals: {:?}", calibration.residuals);
    println!("   Norm: {:.4}\n", calibration.norm);
    scope.transform = calibration.transform;

    scope.select_region(200, 120, 64, 64)?;
    let servo_config = ServoConfig::default()
        .with_settle(Duration::ZERO)
        .with_hold_at_end(false);
    let run = scope.track_selection(&servo_config)?;

    println!("🎯 Centring: {:?} ({} moves)", run.status(), run.iteration());
    if let Some(start) = run.initial_position() {
        println!("   Start: ({:.2}, {:.2})", start.x, start.y);
    }
    for (step, position) in run.stage_moves().iter().zip(run.camera_positions()) {
        println!("   Move {} -> ({:.2}, {:.2})", step, position.x, position.y);
    }
    println!("   Stage now at {}", scope.stage.position());

    let mut datafile = Datafile::in_dir(std::env::temp_dir());
    let group = datafile.new_group("emulated_servo", Some("Synthetic scene demo"))?;
    datafile.add_data(&group, "calibration", &calibration, None)?;
    datafile.add_data(&group, "run", &run, None)?;
    println!("\n💾 Saved to {}", datafile.path().display());

    Ok(())
}
