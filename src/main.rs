use std::{io::BufRead, sync::Arc, thread, time::Duration};

use clap::Parser;
use crossbeam_channel::bounded;
use sweep_slurper::{
    args::{convert_filter, Args, Deployment},
    broadcast::Broadcast,
    capture::{Capture, CaptureParams, Feed},
    exfil::{Exfil, ExfilParams},
    fft::{transform_worker, TransformParams},
    flags::ControlFlags,
    instrument::{AcqConfig, Instrument, SimInstrument, TriggerKind, Units},
    ring::RingBuffer,
    SampleBlock, SpectrumRecord, BLOCK_LEN, IF_BANDWIDTH,
};
use tracing::{error, info};

const POLL: Duration = Duration::from_millis(1);

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let flags = Arc::new(ControlFlags::new());

    {
        let flags = Arc::clone(&flags);
        ctrlc::set_handler(move || {
            info!("interrupt, stopping processes");
            flags.halt();
        })
        .expect("installing the interrupt handler");
    }

    // "q" + enter on the console also begins the ordered shutdown
    {
        let flags = Arc::clone(&flags);
        thread::Builder::new().name("console".into()).spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) if l.trim() == "q" => {
                        info!("stopping processes");
                        flags.halt();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })?;
    }

    let config = AcqConfig {
        center_freq: args.center_freq,
        // Raw blocks always come from one native window
        span: match args.mode {
            Deployment::Raw => args.span.min(IF_BANDWIDTH),
            Deployment::Sweep => args.span,
        },
        ref_level_db: args.ref_level,
        attenuation_db: args.attenuation,
        gain: args.gain,
        rbw: args.rbw,
        vbw: args.rbw,
        sweep_time: args.sweep_time,
        window: args.window,
        units: Units::Power,
        trigger: TriggerKind::None,
    };

    let fault_rate = args.fault_rate;
    let factory =
        Box::new(move || Box::new(SimInstrument::new(fault_rate)) as Box<dyn Instrument>);

    let (msg_tx, msg_rx) = bounded(1024);
    let (feed_tx, feed_rx) = bounded(32);

    let broadcast = Broadcast::bind(("0.0.0.0", args.port), feed_rx, Arc::clone(&flags), POLL)?;

    let mut worker_handles = Vec::new();
    let (feed, transformed) = match args.mode {
        Deployment::Sweep => {
            // No FFT pool in this deployment; mark the stage finished so the
            // log thread doesn't wait on it
            flags.transform_done();
            (Feed::Sweep, None)
        }
        Deployment::Raw => {
            let raw = Arc::new(RingBuffer::new(args.capacity, || {
                SampleBlock::zeroed(BLOCK_LEN)
            }));
            let transformed = Arc::new(RingBuffer::new(args.capacity, SpectrumRecord::default));
            let params = TransformParams {
                window_len: args.window_len,
                overlap: args.window_overlap,
                start_freq: config.center_freq - config.span / 2.0,
                bin_size: config.span / (args.window_len / 2 + 1) as f64,
                poll: POLL,
            };
            for id in 0..args.workers.max(1) {
                let params = params.clone();
                let raw = Arc::clone(&raw);
                let out = Arc::clone(&transformed);
                let flags = Arc::clone(&flags);
                worker_handles.push(
                    thread::Builder::new()
                        .name(format!("fft-{id}"))
                        .spawn(move || transform_worker(id, params, raw, out, flags))?,
                );
            }
            (Feed::Raw(raw), Some(transformed))
        }
    };

    let capture = Capture::new(
        factory,
        CaptureParams {
            config,
            num_average: args.num_average,
            bin_samples: args.bin_samples,
            overlap: args.overlap,
            cal_check_cycles: args.cal_check,
            rate_log_cycles: 100,
            block_len: BLOCK_LEN,
            poll: POLL,
        },
        feed,
        msg_tx,
        Arc::clone(&flags),
    );
    let capture_handle = thread::Builder::new()
        .name("capture".into())
        .spawn(move || capture.run())?;

    let exfil = Exfil::new(
        ExfilParams {
            out_dir: args.out_dir.clone(),
            rotate_every: Duration::from_secs(args.rotate_secs),
            num_average: matches!(args.mode, Deployment::Raw).then_some(args.num_average),
            poll: POLL,
        },
        msg_rx,
        transformed,
        feed_tx,
        Arc::clone(&flags),
    );
    let exfil_handle = thread::Builder::new()
        .name("exfil".into())
        .spawn(move || exfil.run())?;

    let broadcast_handle = thread::Builder::new()
        .name("broadcast".into())
        .spawn(move || broadcast.run())?;

    // Teardown is strictly ordered: each join blocks on the previous stage's
    // actual termination, never on a timeout, so in-flight data drains instead
    // of getting truncated.
    info!("joining on the acquisition thread");
    match capture_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%e, "capture stage failed"),
        Err(_) => error!("capture thread panicked"),
    }

    info!("joining on the FFT worker pool");
    for handle in worker_handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(%e, "FFT worker failed"),
            Err(_) => error!("FFT worker panicked"),
        }
    }
    flags.transform_done();

    info!("joining on the log thread");
    match exfil_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%e, "persistence stage failed"),
        Err(_) => error!("log thread panicked"),
    }

    info!("joining on the broadcast thread");
    if broadcast_handle.join().is_err() {
        error!("broadcast thread panicked");
    }

    info!("threads stopped, shutdown complete, exiting");
    Ok(())
}
