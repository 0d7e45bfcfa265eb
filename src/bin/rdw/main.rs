//! Command line front end: dry runs, the host bridge, and the config
//! template.

use clap::Parser;
use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use rdw_staircase::{
    args::{BridgeCommand, CommandTask, RdwArgs, SimulateCommand},
    blink_gate::BlinkSample,
    bridge_protocol::{BridgeInput, CommandLink, HostCommand},
    component::run_component,
    config::ExperimentConfig,
    csv_writer::CsvTrialWriter,
    sensor_feed::{SensorFeed, SensorFrame},
    session::Session,
    simulated_participant::{ParticipantModel, Simulation},
    trial_record::{ChannelSink, TrialRecord},
};

use std::{
    io::{self, BufRead, Write},
    process,
    str::FromStr,
    sync::mpsc::{self, Receiver},
    thread::{spawn, JoinHandle},
    time::Duration,
};

// Example:
// cargo run --bin rdw -- simulate --participant 3 --out trials.csv --seed 7
// cargo run --bin rdw -- --config study.ron bridge -p 4 -o p4.csv < host.log

fn main() {
    env_logger::init();
    let args = RdwArgs::parse();

    let config = match &args.config {
        Some(path) => match ExperimentConfig::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}: {}", path, e);
                process::exit(2);
            }
        },
        None => ExperimentConfig::default(),
    };

    match args.command {
        CommandTask::PrintConfig => {
            let text = config
                .to_ron_string()
                .expect("Failed to serialize configuration");
            println!("{}", text);
        }
        CommandTask::Simulate(cmd) => simulate(config, cmd),
        CommandTask::Bridge(cmd) => bridge(config, cmd),
    }
}

/// Starts the CSV writer on its own thread.
fn spawn_writer(path: &str) -> (ChannelSink, JoinHandle<()>, Receiver<io::Result<()>>) {
    let writer = CsvTrialWriter::create(path).expect("Failed to open trial log");
    let (row_tx, row_rx) = mpsc::channel::<TrialRecord>();
    let (result_tx, result_rx) = mpsc::channel();
    let handle = run_component(Box::new(writer), row_rx, result_tx);
    (ChannelSink::new(row_tx), handle, result_rx)
}

fn report_writes(path: &str, results: Receiver<io::Result<()>>) {
    let mut written = 0;
    for result in results.try_iter() {
        match result {
            Ok(()) => written += 1,
            Err(e) => warn!("Failed to write a row to {}: {}", path, e),
        }
    }
    info!("{} rows written to {}", written, path);
}

fn simulate(config: ExperimentConfig, cmd: SimulateCommand) {
    let mut model = ParticipantModel::default();
    if let Some(threshold) = cmd.blink_threshold {
        model.blink_threshold = threshold;
    }
    if let Some(threshold) = cmd.walking_threshold {
        model.walking_threshold = threshold;
    }

    let (sink, writer, results) = spawn_writer(&cmd.outfile);
    let mut sim = Simulation::new(
        config,
        cmd.participant,
        model,
        cmd.seed,
        cmd.tick_hz,
        Box::new(sink),
    );

    let tick = Duration::from_secs_f64(sim.tick_length());
    while sim.step() {
        if cmd.realtime {
            spin_sleep::sleep(tick);
        }
    }
    info!("Simulation finished after {:.1}s", sim.now());
    let thresholds = sim.session().sequencer().thresholds().to_vec();

    // dropping the session closes the row channel
    drop(sim);
    writer.join().expect("Trial writer panicked");
    report_writes(&cmd.outfile, results);

    for (modality, threshold) in thresholds {
        println!("{}: {:.3} {}", modality, threshold, modality.unit());
    }
}

fn bridge(config: ExperimentConfig, cmd: BridgeCommand) {
    let (sink, writer, results) = spawn_writer(&cmd.outfile);

    let (command_tx, command_rx) = mpsc::channel::<HostCommand>();
    let link = CommandLink::new(command_tx);
    let printer = spawn(move || {
        let stdout = io::stdout();
        for command in command_rx {
            let mut out = stdout.lock();
            if writeln!(out, "{}", command).and_then(|_| out.flush()).is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(
        config,
        cmd.participant,
        StdRng::seed_from_u64(cmd.seed),
        Box::new(link.clone()),
        Some(Box::new(link.clone())),
        Box::new(link),
        Box::new(sink),
    );

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let _reader = spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut feed = SensorFeed::new();
    let mut frame = SensorFrame::empty(0.0);
    let mut now = 0.0;
    for line in line_rx {
        if line.trim().is_empty() {
            continue;
        }
        let input = match BridgeInput::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!("Was unable to parse bridge line: {}", e);
                continue;
            }
        };
        debug!("Received {:?}", input);

        match input {
            BridgeInput::Start => session.start(now),
            BridgeInput::Eye { left, right } => {
                frame.eyes = Some(BlinkSample {
                    left,
                    right,
                    timestamp_s: now,
                })
            }
            BridgeInput::NoEye => frame.eyes = None,
            BridgeInput::Head(position) => frame.head = Some(position),
            BridgeInput::Tick(t) => {
                now = t;
                frame.time_s = t;
                if let Some(eyes) = frame.eyes.as_mut() {
                    eyes.timestamp_s = t;
                }
                feed.push(frame);
                frame = SensorFrame::empty(t);
                if let Err(e) = session.drain(&mut feed) {
                    debug!("Tick at {:.3}s: {}", t, e);
                }
            }
            BridgeInput::RunEnd => session.run_end(now),
            BridgeInput::Choice(response) => {
                session.respond(now, response);
            }
        }

        if session.is_finished() {
            break;
        }
    }

    let thresholds = session.sequencer().thresholds().to_vec();
    drop(session);
    writer.join().expect("Trial writer panicked");
    printer.join().expect("Output printer panicked");
    report_writes(&cmd.outfile, results);
    for (modality, threshold) in thresholds {
        info!("{} threshold: {:.3} {}", modality, threshold, modality.unit());
    }
}
