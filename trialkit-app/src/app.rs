use crate::config::AppConfig;
use anyhow::{Context, Result, bail};
use std::io::BufRead;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trialkit_core::{Paradigm, Response, RunState, TaskKind};
use trialkit_experiment::{
    ControllerConfig, Cue, JsonlLogger, ParamEdit, ParameterPanel, RecordingCoordinator,
    RunController, RunHandle, RunStatus, TargetClassOutput, TriggerPublisher, WindowSampler,
};
use trialkit_timing::TokioTimer;

/// One line typed into the operator console.
#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Start(Option<String>),
    Stop,
    Respond(Response),
    /// Decoder output for a feedback run; `None` clears the display.
    Decode(Option<String>),
    Set(ParamEdit),
    Status,
    Quit,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        let command = match word {
            "" => return Ok(None),
            "start" => Self::Start(arg),
            "stop" => Self::Stop,
            "r" | "respond" => Self::Respond(arg.map(Response::choose).unwrap_or_default()),
            "decode" => Self::Decode(arg.filter(|label| label != "-")),
            "classes" => Self::Set(ParamEdit::parse("classes", rest)?),
            "set" => {
                let Some((field, value)) = rest.split_once(char::is_whitespace) else {
                    bail!("usage: set <field> <value>");
                };
                Self::Set(ParamEdit::parse(field, value)?)
            }
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command {other:?}"),
        };
        Ok(Some(command))
    }
}

pub struct App {
    config: AppConfig,
    seed: Option<u64>,
}

impl App {
    pub fn new(config: AppConfig, seed: Option<u64>) -> Self {
        Self { config, seed }
    }

    /// Wires logger, sampler, publisher and controller, then serves the
    /// console until shutdown. Returns once every task has drained.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let AppConfig {
            task,
            params,
            recording,
            sampler,
        } = self.config;
        let timer = TokioTimer::new();

        let mut panel = ParameterPanel::new(task.clone(), params, Some(sampler.buffer_seconds))
            .context("invalid task parameters")?;

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let logger = tokio::spawn(JsonlLogger::new(log_rx, ack_tx).run());

        let window_sampler =
            WindowSampler::new(timer.clone(), sampler.buffer_seconds).with_logger(log_tx.clone());
        // Outlives the controller so its final flush still reaches the sampler.
        let publisher_stop = CancellationToken::new();
        let (triggers, publisher) =
            TriggerPublisher::spawn(window_sampler, publisher_stop.clone());
        let (target_class, targets) = TargetClassOutput::channel();

        let coordinator =
            RecordingCoordinator::new(log_tx, ack_rx).with_ack_timeout(recording.ack_timeout());
        let controller_config = ControllerConfig {
            data_dir: recording.data_dir,
            buffer_seconds: Some(sampler.buffer_seconds),
            ..ControllerConfig::default()
        };
        let (controller, handle) = RunController::new(
            task.clone(),
            timer,
            panel.subscribe(),
            coordinator,
            triggers,
            controller_config,
        );
        let controller = match self.seed {
            Some(seed) => controller.with_seed(seed),
            None => controller,
        }
        .with_target_class_output(target_class);
        let controller = tokio::spawn(controller.run(shutdown.clone()));
        let watcher = tokio::spawn(watch_status(
            handle.subscribe_status(),
            handle.subscribe_cue(),
        ));
        let announcer = tokio::spawn(announce_targets(targets, task.clone()));

        print_help(task.name());
        serve_console(&handle, &mut panel, &shutdown).await;

        controller.await.context("controller task failed")?;
        publisher_stop.cancel();
        let delivered = publisher.join().await;
        drop(handle);
        logger.await.context("logger task failed")?;
        watcher.await.context("status watcher failed")?;
        announcer.await.context("target class announcer failed")?;
        info!(delivered, "all tasks stopped");
        Ok(())
    }
}

async fn serve_console<P: Paradigm>(
    handle: &RunHandle,
    panel: &mut ParameterPanel<P>,
    shutdown: &CancellationToken,
) {
    let mut lines = spawn_line_reader();
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            info!("console closed; waiting for a shutdown signal");
            shutdown.cancelled().await;
            return;
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err:#}");
                continue;
            }
        };
        match command {
            ConsoleCommand::Start(subdir) => {
                handle.request_start(subdir);
            }
            ConsoleCommand::Stop => {
                handle.request_stop();
            }
            ConsoleCommand::Respond(response) => {
                handle.respond(response);
            }
            ConsoleCommand::Decode(class) => {
                handle.show_decoded(class);
            }
            ConsoleCommand::Set(edit) => {
                if !handle.status().state.controls_enabled() {
                    println!("parameters are locked while a run is active");
                    continue;
                }
                match panel.edit(edit) {
                    Ok(state) => println!(
                        "{} trials, {:.1}-{:.1}s",
                        state.total_trials, state.estimated_duration.0, state.estimated_duration.1
                    ),
                    Err(err) => println!("rejected: {err}"),
                }
            }
            ConsoleCommand::Status => println!("{}", describe(&handle.status())),
            ConsoleCommand::Quit => {
                shutdown.cancel();
                return;
            }
        }
    }
}

/// Reads stdin on a plain thread: a blocked read there cannot hold up
/// runtime shutdown.
fn spawn_line_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "console read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Logs the cued class, with its stimulus frequency where the task has one,
/// until the controller goes away.
async fn announce_targets(mut targets: mpsc::UnboundedReceiver<Option<String>>, task: TaskKind) {
    while let Some(class) = targets.recv().await {
        match class {
            Some(label) => {
                let hz = task.frequency_of(&label);
                info!(class = %label, hz = ?hz, "target class");
            }
            None => debug!("target class cleared"),
        }
    }
}

/// Logs state transitions and cue changes until the controller goes away.
async fn watch_status(mut status: watch::Receiver<RunStatus>, mut cue: watch::Receiver<Cue>) {
    let mut last_state = status.borrow().state;
    let mut cue_open = true;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.state != last_state || current.state == RunState::Idle {
                    info!(
                        state = ?current.state,
                        indicator = ?current.indicator,
                        recording = %current.recording.label(),
                        "{}",
                        current.message
                    );
                    last_state = current.state;
                } else {
                    debug!(
                        completed = current.progress.completed,
                        total = ?current.progress.total,
                        "progress"
                    );
                }
            }
            changed = cue.changed(), if cue_open => {
                if changed.is_err() {
                    cue_open = false;
                    continue;
                }
                let current = cue.borrow_and_update().clone();
                debug!(cue = ?current, "cue");
            }
        }
    }
}

fn describe(status: &RunStatus) -> String {
    let total = status
        .progress
        .total
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    format!(
        "{:?} [{:?}] {} | trials {}/{} | {} | button: {}",
        status.state,
        status.indicator,
        status.message,
        status.progress.completed,
        total,
        status.recording.label(),
        status.state.button_label()
    )
}

fn print_help(task: &str) {
    println!("=== {task} ===");
    println!("start [subdir]       start a run, recording into <data_dir>/<subdir> when given");
    println!("stop                 stop the current run");
    println!("r [choice]           respond to the current stimulus");
    println!("decode <class|->     show a decoded class during a feedback run");
    println!("set <field> <value>  edit a parameter between runs");
    println!("classes a,b,c        replace the class set");
    println!("status               show run status");
    println!("quit                 finish and exit\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialkit_experiment::RecordingIndicator;

    #[test]
    fn parses_console_lines() {
        assert_eq!(ConsoleCommand::parse("  ").unwrap(), None);
        assert_eq!(
            ConsoleCommand::parse("start p01").unwrap(),
            Some(ConsoleCommand::Start(Some("p01".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("start").unwrap(),
            Some(ConsoleCommand::Start(None))
        );
        assert_eq!(
            ConsoleCommand::parse("r").unwrap(),
            Some(ConsoleCommand::Respond(Response::press()))
        );
        assert_eq!(
            ConsoleCommand::parse("r left").unwrap(),
            Some(ConsoleCommand::Respond(Response::choose("left")))
        );
        assert_eq!(
            ConsoleCommand::parse("decode left").unwrap(),
            Some(ConsoleCommand::Decode(Some("left".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("decode -").unwrap(),
            Some(ConsoleCommand::Decode(None))
        );
        assert_eq!(
            ConsoleCommand::parse("set iti_max 2.5").unwrap(),
            Some(ConsoleCommand::Set(ParamEdit::ItiMax(2.5)))
        );
        assert_eq!(
            ConsoleCommand::parse("classes up, down").unwrap(),
            Some(ConsoleCommand::Set(ParamEdit::Classes(vec![
                "up".into(),
                "down".into()
            ])))
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ConsoleCommand::parse("jump").is_err());
        assert!(ConsoleCommand::parse("set trials").is_err());
        assert!(ConsoleCommand::parse("set trials many").is_err());
    }

    #[test]
    fn describes_status() {
        let status = RunStatus {
            state: RunState::Running,
            recording: RecordingIndicator::NotRecording,
            ..RunStatus::default()
        };
        let text = describe(&status);
        assert!(text.contains("NOT RECORDING"));
        assert!(text.contains("trials 0/-"));
        assert!(text.contains("button: Stop"));
    }
}
