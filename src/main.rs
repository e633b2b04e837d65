use log::info;
use std::thread;
use std::time::Duration;

use pixelmap::link::TempoMonitor;
use pixelmap::{EngineConfig, LightingEngine};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env();
    info!("[MAIN] Config file: {:?}", config.config_path);

    let engine = LightingEngine::open(&config);
    let tempo = TempoMonitor::start();
    engine.attach_tempo(tempo.handle());
    engine.start();

    loop {
        thread::sleep(STATUS_INTERVAL);
        let status = engine.status();
        let tempo = engine.tempo();
        info!(
            "[MAIN] {:?} on {} | {} / {} | {} strip(s), {} mask(s) | universes {:?} | {:.1} BPM",
            status.state,
            status.current_ip.as_deref().unwrap_or("0.0.0.0"),
            status.mode.as_str(),
            status.effect,
            status.strips,
            status.masks,
            status.active_universes,
            tempo.bpm,
        );
    }
}
