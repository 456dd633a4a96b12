//! Flycave Calibration Tool
//!
//! Offline entry point: validates a calibration configuration and inspects
//! previously recorded calibration logs. The live calibration loop is driven
//! by the hosting process, which owns the camera, laser, and display-server
//! transports and hands them to `CalibrationEngine`.

use flycave_calibrator::config::CalibrationConfig;
use flycave_calibrator::projector::DisplayServer;
use flycave_calibrator::store::CorrespondenceStore;
use std::collections::BTreeMap;
use std::path::Path;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config.json> [calibration.cal]", args[0]);
        std::process::exit(2);
    }

    let config = match CalibrationConfig::load(Path::new(&args[1])) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "config ok: {} tracking cameras, {} display server(s)",
        config.tracking_cameras.len(),
        config.display_servers.len()
    );

    for (name, ds_cfg) in &config.display_servers {
        match DisplayServer::from_config(name, ds_cfg, config.mask_dir.as_deref()) {
            Ok(ds) => log::info!("{}: {} virtual display(s)", name, ds.vdisps.len()),
            Err(e) => {
                log::error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let Some(log_path) = args.get(2) else {
        return;
    };

    let mut per_vdisp: BTreeMap<(String, String), u32> = BTreeMap::new();
    let total = match CorrespondenceStore::read_all(Path::new(log_path), |sample| {
        *per_vdisp
            .entry((sample.display_server.clone(), sample.vdisp.clone()))
            .or_insert(0) += 1;
    }) {
        Ok(total) => total,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    log::info!("number of laser points {}", total);
    for ((ds, vdisp), count) in &per_vdisp {
        log::info!("  {}:{} {} points", ds, vdisp, count);
    }
}
