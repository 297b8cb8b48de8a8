use eframe::egui;
use egui::Color32;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender};
use platescanner::axis::Direction;
use platescanner::camera::{CaptureThread, Frame};
use platescanner::config_loader::{self, ScannerSettings};
use platescanner::events::{EventBus, ScannerEvent};
use platescanner::image_metrics::{analyze, AnalysisSettings, ImageQuality, MAX_ROTATION_DEG};
use platescanner::logging;
use platescanner::scanner::Scanner;

const LOG_LINES: usize = 500;
const ANALYSIS_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    /// Simulated axes regardless of the host block
    #[arg(long)]
    simulate: bool,
}

struct ScannerGui {
    scanner: Arc<Scanner>,
    events: Receiver<ScannerEvent>,
    capture: Option<CaptureThread>,
    frame: Option<Frame>,
    texture: Option<egui::TextureHandle>,
    analysis_settings: AnalysisSettings,
    analysis_tx: Sender<Result<ImageQuality, String>>,
    analysis_rx: Receiver<Result<ImageQuality, String>>,
    analysis_busy: bool,
    last_analysis: Option<Instant>,
    quality: Option<Result<ImageQuality, String>>,
    log: VecDeque<String>,
    /// Step counts for Go to / Return to, one per axis.
    moves: Vec<i64>,
    /// Jog button currently held per axis.
    held: Vec<Option<Direction>>,
}

impl ScannerGui {
    fn new(scanner: Arc<Scanner>, events: Receiver<ScannerEvent>, settings: &ScannerSettings) -> Self {
        let capture = match settings.camera.open() {
            Ok(Some(source)) => {
                match CaptureThread::spawn(source, settings.camera.interval(), scanner.events().clone()) {
                    Ok(capture) => Some(capture),
                    Err(e) => {
                        scanner.events().warn("camera", format!("{:#}", e));
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                scanner.events().warn("camera", format!("{:#}", e));
                None
            }
        };
        let axes = scanner.axes().len();
        let (analysis_tx, analysis_rx) = bounded(1);
        Self {
            scanner,
            events,
            capture,
            frame: None,
            texture: None,
            analysis_settings: settings.image.clone(),
            analysis_tx,
            analysis_rx,
            analysis_busy: false,
            last_analysis: None,
            quality: None,
            log: VecDeque::new(),
            moves: vec![0; axes],
            held: vec![None; axes],
        }
    }

    fn log(&mut self, line: String) {
        if self.log.len() == LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    /// Run a blocking scanner call off the UI thread.
    fn spawn(&mut self, name: &str, job: impl FnOnce(&Scanner) + Send + 'static) {
        let scanner = Arc::clone(&self.scanner);
        if let Err(e) = thread::Builder::new().name(name.to_string()).spawn(move || job(&scanner)) {
            self.log(format!("could not start {}: {}", name, e));
        }
    }

    fn drain_events(&mut self) {
        let events: Vec<ScannerEvent> = self.events.try_iter().collect();
        for event in events {
            match &event {
                ScannerEvent::StateChanged { .. } => continue,
                ScannerEvent::SnapshotRequest { coordinates } => {
                    if let Err(e) = self.scanner.handle_snapshot_request(coordinates, self.frame.as_ref()) {
                        self.scanner.events().warn("calibration log", format!("{:#}", e));
                    }
                }
                _ => {}
            }
            self.log(format!("{} {}", chrono::Local::now().format("%H:%M:%S"), event));
        }
    }

    fn poll_camera(&mut self, ctx: &egui::Context) {
        let Some(frame) = self.capture.as_ref().and_then(|c| c.latest()) else {
            return;
        };
        let pixels: Vec<u8> = frame.pixels.iter().copied().collect();
        let image = egui::ColorImage::from_gray([frame.width(), frame.height()], &pixels);
        match &mut self.texture {
            Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
            None => self.texture = Some(ctx.load_texture("camera", image, egui::TextureOptions::LINEAR)),
        }

        let due = self.last_analysis.map_or(true, |t| t.elapsed() >= ANALYSIS_INTERVAL);
        if due && !self.analysis_busy {
            self.analysis_busy = true;
            self.last_analysis = Some(Instant::now());
            let settings = self.analysis_settings.clone();
            let tx = self.analysis_tx.clone();
            let input = frame.clone();
            rayon::spawn(move || {
                let result = analyze(&input, &settings).map(|a| a.quality).map_err(|e| format!("{:#}", e));
                let _ = tx.send(result);
            });
        }
        self.frame = Some(frame);
    }

    fn poll_analysis(&mut self) {
        if let Ok(result) = self.analysis_rx.try_recv() {
            self.analysis_busy = false;
            self.quality = Some(result);
        }
    }

    /// Press-and-hold jog: pressing activates, releasing stops.
    fn jog_button(&mut self, ui: &mut egui::Ui, index: usize, direction: Direction, label: &str) {
        let response = ui.add(egui::Button::new(label).sense(egui::Sense::click_and_drag()));
        let down = response.is_pointer_button_down_on();
        let axis = Arc::clone(&self.scanner.axes()[index]);
        if down && self.held[index].is_none() {
            self.held[index] = Some(direction);
            axis.activate(direction);
        } else if !down && self.held[index] == Some(direction) {
            self.held[index] = None;
            axis.stop();
        }
    }

    fn axis_panel(&mut self, ui: &mut egui::Ui) {
        let axes: Vec<_> = self.scanner.axes().to_vec();
        egui::Grid::new("axes").num_columns(6).spacing([8.0, 6.0]).show(ui, |ui| {
            for (i, axis) in axes.iter().enumerate() {
                ui.strong(axis.name());
                ui.monospace(format!("{:>8}", axis.position()));
                let colour = if axis.is_running() { Color32::LIGHT_GREEN } else { Color32::GRAY };
                ui.colored_label(colour, axis.state().to_string());
                self.jog_button(ui, i, Direction::Reverse, "◀");
                self.jog_button(ui, i, Direction::Forward, "▶");
                if ui.button("Home").clicked() {
                    let name = axis.name().to_string();
                    self.spawn(&format!("{}-home", name), move |scanner| {
                        if let Some(axis) = scanner.axis(&name) {
                            if let Err(e) = axis.home() {
                                scanner.events().warn(&name, format!("{:#}", e));
                            }
                        }
                    });
                }
                ui.end_row();
            }
        });

        ui.separator();
        ui.horizontal(|ui| {
            for (axis, steps) in axes.iter().zip(self.moves.iter_mut()) {
                ui.label(format!("{} steps", axis.name()));
                ui.add(egui::DragValue::new(steps).speed(10.0).clamp_range(-200_000..=200_000));
            }
        });
        ui.horizontal(|ui| {
            if ui.button("Go to").clicked() {
                let moves = self.moves.clone();
                self.spawn("go-to", move |scanner| report_moves(scanner, scanner.go_to(&moves)));
            }
            if ui.button("Return to").clicked() {
                let moves = self.moves.clone();
                self.spawn("return-to", move |scanner| report_moves(scanner, scanner.return_to(&moves)));
            }
        });

        ui.separator();
        ui.horizontal(|ui| {
            let calibrating = self.scanner.calibrator().is_running();
            if ui.add_enabled(!calibrating, egui::Button::new("Calibrate")).clicked() {
                self.scanner.calibrator().run();
            }
            if ui.add_enabled(calibrating, egui::Button::new("Stop calibrate")).clicked() {
                self.scanner.calibrator().stop();
            }
            if ui.add(egui::Button::new("Snapshot")).clicked() {
                match &self.frame {
                    Some(frame) => {
                        if let Err(e) = self.scanner.calibration_log().save_snapshot(frame) {
                            self.scanner.events().warn("snapshot", format!("{:#}", e));
                        }
                    }
                    None => self.scanner.events().warn("snapshot", "no camera frame yet"),
                }
            }
        });
        let stop = egui::Button::new(egui::RichText::new("STOP").strong().color(Color32::WHITE))
            .fill(Color32::from_rgb(180, 30, 30))
            .min_size(egui::vec2(120.0, 36.0));
        if ui.add(stop).clicked() {
            self.held.iter_mut().for_each(|h| *h = None);
            self.scanner.stop_all();
        }
        ui.label(format!("active motors: {}", self.scanner.active_motors()));
    }

    fn quality_panel(&self, ui: &mut egui::Ui) {
        match &self.quality {
            None => {
                ui.label("no image metrics yet");
            }
            Some(Err(e)) => {
                ui.colored_label(Color32::LIGHT_RED, e);
            }
            Some(Ok(q)) => {
                egui::Grid::new("quality").num_columns(3).show(ui, |ui| {
                    ui.label("");
                    ui.strong("x");
                    ui.strong("y");
                    ui.end_row();
                    ui.label("grid found");
                    ui.label(q.x.grid_found.to_string());
                    ui.label(q.y.grid_found.to_string());
                    ui.end_row();
                    ui.label("contrast");
                    ui.label(format!("{:.1}", q.x.contrast));
                    ui.label(format!("{:.1}", q.y.contrast));
                    ui.end_row();
                    ui.label("sharpness");
                    ui.label(format!("{:.1}", q.x.sharpness));
                    ui.label(format!("{:.1}", q.y.sharpness));
                    ui.end_row();
                    ui.label("mean (lines)");
                    ui.label(format!("{:.1} ({:.1})", q.x.mean, q.x.mean_outside_mask));
                    ui.label(format!("{:.1} ({:.1})", q.y.mean, q.y.mean_outside_mask));
                    ui.end_row();
                });
                ui.label(format!("laplacian variance {:.1}, RoI area {}", q.laplacian_variance, q.roi_area));
            }
        }
    }
}

fn report_moves(scanner: &Scanner, result: Result<Vec<Result<i64>>>) {
    match result {
        Ok(moves) => {
            for (axis, moved) in scanner.axes().iter().zip(moves) {
                if let Err(e) = moved {
                    scanner.events().warn(axis.name(), format!("{:#}", e));
                }
            }
        }
        Err(e) => scanner.events().warn("scanner", format!("{:#}", e)),
    }
}

impl eframe::App for ScannerGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();
        self.poll_camera(ctx);
        self.poll_analysis();

        egui::SidePanel::left("controls").min_width(360.0).show(ctx, |ui| {
            ui.heading("Plate Scanner");
            self.axis_panel(ui);
            ui.separator();
            ui.horizontal(|ui| {
                ui.label("rotate (deg)");
                let max = MAX_ROTATION_DEG - 0.1;
                ui.add(
                    egui::DragValue::new(&mut self.analysis_settings.rotation_deg)
                        .speed(0.1)
                        .clamp_range(-max..=max)
                        .fixed_decimals(1),
                );
            });
            self.quality_panel(ui);
        });

        egui::TopBottomPanel::bottom("log").resizable(true).min_height(140.0).show(ctx, |ui| {
            egui::ScrollArea::vertical().stick_to_bottom(true).show(ui, |ui| {
                for line in &self.log {
                    ui.monospace(line);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| match &self.texture {
            Some(texture) => {
                ui.add(egui::Image::new(texture).shrink_to_fit());
            }
            None => {
                ui.label("No camera");
            }
        });

        // Positions and jogs change without input events.
        ctx.request_repaint_after(Duration::from_millis(50));
    }
}

impl Drop for ScannerGui {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.scanner.stop_all();
    }
}

fn load_settings(args: &Args) -> Result<ScannerSettings> {
    let hostname = args.host.clone().unwrap_or_else(config_loader::current_hostname);
    let path = args.config.clone().unwrap_or_else(config_loader::yaml_path);
    let mut settings = config_loader::load_scanner_settings_from(&path, &hostname)?;
    if args.simulate {
        settings.simulate = true;
        settings.gpio_enabled = false;
    }
    Ok(settings)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    logging::init(&settings.calibration.log_dir)?;

    let (events, rx) = EventBus::new();
    let scanner = Arc::new(Scanner::new(&settings, events)?);
    let app = ScannerGui::new(Arc::clone(&scanner), rx, &settings);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 760.0]),
        ..Default::default()
    };
    let result = eframe::run_native("Plate Scanner", options, Box::new(|_cc| Box::new(app)));
    scanner.shutdown();
    result.map_err(|e| anyhow::anyhow!("GUI failed: {}", e))
}
