use crate::acquisition::{AcqEvent, AcquisitionState};
use crate::filter::NodeStatus;
use crate::instrument::InstrumentId;
use crate::session::Session;
use crate::utils::Counter;
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{debug, error, info, warn};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Style, Stylize},
    symbols::border,
    text::{Line, Span, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

/// Refresh period of the status view.
const FRAME: Duration = Duration::from_millis(50);

/// The processing side of a session with a terminal status view.
///
/// Every frame it runs the filter graph if captures are waiting, drains
/// acquisition events into the rate counter and redraws.
pub struct Status {
    pub session: Session,
    pub counter: Counter,
    pub last_error: Option<String>,
    pub exit: bool,
    selected: usize,
}

impl Status {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            counter: Counter::default(),
            last_error: None,
            exit: false,
            selected: 0,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let ticker = tick(FRAME);
        self.session.start()?;
        self.session.arm_all();

        while !self.exit {
            let _ = ticker.recv();
            self.update();
            self.handle_events()?;
            terminal.draw(|f| self.draw(f))?;
        }

        self.session.stop_all();
        self.session.shutdown();
        Ok(())
    }

    /// One frame of bookkeeping without touching the terminal.
    pub fn update(&mut self) {
        if let Some(Err(e)) = self.session.poll_cycle() {
            self.last_error = Some(e.to_string());
        }

        while let Ok(ev) = self.session.events().try_recv() {
            match ev {
                AcqEvent::Downloaded { bytes, .. } => self.counter.increment(bytes),
                AcqEvent::Error { instrument, message } => {
                    self.counter.record_error();
                    self.last_error = Some(format!("instrument {}: {}", instrument.0, message));
                }
                AcqEvent::StateChanged { .. } => {}
            }
        }
        self.counter.expire();
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        let count = self.session.instruments().count();
        let selected = InstrumentId(self.selected);
        match key_event.code {
            KeyCode::Char('q') => self.exit = true,
            KeyCode::Char('a') => self.session.arm_all(),
            KeyCode::Char('s') => self.session.stop_all(),
            KeyCode::Char('r') => self.session.reconnect(selected),
            KeyCode::Up if self.selected > 0 => self.selected -= 1,
            KeyCode::Down if self.selected + 1 < count => self.selected += 1,
            _ => {}
        }
    }

    fn instrument_lines(&self) -> Vec<Line<'_>> {
        self.session
            .instruments()
            .map(|(id, name, state)| {
                let marker = if id.0 == self.selected { "> " } else { "  " };
                let label = match state {
                    AcquisitionState::Disconnected => state.label().red().bold(),
                    AcquisitionState::Idle => state.label().dark_gray(),
                    _ => state.label().green(),
                };
                Line::from(vec![marker.into(), format!("{:<16}", name).into(), label])
            })
            .collect()
    }

    fn filter_lines(&self) -> Vec<Line<'_>> {
        let graph = self.session.graph();
        graph
            .ids()
            .into_iter()
            .filter_map(|id| graph.node(id))
            .map(|node| {
                let status = match node.status() {
                    NodeStatus::Pending => Span::styled("pending", Style::new().dark_gray()),
                    NodeStatus::Ok => Span::styled("ok", Style::new().green()),
                    NodeStatus::Failed(reason) => Span::styled(reason.clone(), Style::new().red()),
                };
                Line::from(vec![
                    format!("  {:<16}", node.name()).into(),
                    format!("{:<10}", node.filter().kind()).into(),
                    format!("runs {:<8}", node.run_count()).into(),
                    status,
                ])
            })
            .collect()
    }

    fn measurement_lines(&self) -> Vec<Line<'_>> {
        self.session
            .measurements()
            .into_iter()
            .map(|m| {
                let value = match m.value {
                    Some(v) => format!("{:.6e} {}", v, m.unit).yellow(),
                    None => "--".dark_gray(),
                };
                Line::from(vec![format!("  {:<16}", m.name).into(), value])
            })
            .collect()
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(" Scope Session ".bold());
        let instructions = Line::from(vec![
            " Quit ".into(),
            "<Q>".blue().bold(),
            " Arm ".into(),
            "<A>".blue().bold(),
            " Stop ".into(),
            "<S>".blue().bold(),
            " Reconnect ".into(),
            "<R> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);
        let inner = block.inner(area);
        block.render(area, buf);

        let [stats, instruments, filters, measurements] = Layout::vertical([
            Constraint::Length(2),
            Constraint::Min(3),
            Constraint::Min(3),
            Constraint::Min(3),
        ])
        .areas(inner);

        let mut stats_lines = vec![Line::from(vec![
            "Elapsed: ".into(),
            self.counter.t_begin.elapsed().as_secs().to_string().yellow(),
            " s".into(),
            "  Captures: ".into(),
            self.counter.n_captures.to_string().yellow(),
            "  Data rate: ".into(),
            format!("{:.2}", self.counter.rate()).yellow(),
            " MB/s".into(),
            "  Cycles: ".into(),
            self.session.cycles().to_string().yellow(),
            "  Errors: ".into(),
            self.counter.n_errors.to_string().yellow(),
        ])];
        if let Some(e) = &self.last_error {
            stats_lines.push(Line::from(e.as_str().red()));
        }
        Paragraph::new(Text::from(stats_lines)).render(stats, buf);

        Paragraph::new(self.instrument_lines())
            .block(Block::new().title(" Instruments ".bold()))
            .render(instruments, buf);
        Paragraph::new(self.filter_lines())
            .block(Block::new().title(" Filters ".bold()))
            .render(filters, buf);
        Paragraph::new(self.measurement_lines())
            .block(Block::new().title(" Measurements ".bold()))
            .render(measurements, buf);
    }
}

/// Run `cycles` processing cycles without a terminal, logging each report.
///
/// Stops early once no instrument can deliver another capture, for example
/// after a single-shot trigger or when every instrument is disconnected.
/// Returns the number of cycles run.
pub fn run_headless(session: &mut Session, cycles: u64) -> Result<u64> {
    session.start()?;
    session.arm_all();
    let mut counter = Counter::default();
    let mut done = 0;
    while done < cycles {
        match session.wait_cycle(Duration::from_secs(1)) {
            Some(Ok(report)) => {
                done += 1;
                info!(
                    "Cycle {}: ran {}, skipped {}, failed {}",
                    done,
                    report.ran.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
            }
            Some(Err(e)) => {
                error!("{}", e);
                return Err(e.into());
            }
            None => {
                let states: Vec<String> = session
                    .instruments()
                    .map(|(_, name, state)| format!("{}={}", name, state.label()))
                    .collect();
                if !session.has_work() {
                    // A publish may have raced the timeout.
                    if let Some(Ok(_)) = session.poll_cycle() {
                        done += 1;
                    }
                    warn!(
                        "No instrument is acquiring ({}); stopping after {} of {} cycles",
                        states.join(", "),
                        done,
                        cycles
                    );
                    break;
                }
                debug!("Waiting for captures ({})", states.join(", "));
            }
        }
        while let Ok(ev) = session.events().try_recv() {
            if let AcqEvent::Downloaded { bytes, .. } = ev {
                counter.increment(bytes);
            }
        }
    }
    for m in session.measurements() {
        match m.value {
            Some(v) => info!("{} = {} {}", m.name, v, m.unit),
            None => info!("{} = --", m.name),
        }
    }
    info!(
        "{} captures, {:.3} MB/s average",
        counter.n_captures,
        counter.average_rate()
    );
    session.stop_all();
    session.shutdown();
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{AcquisitionSettings, AcquisitionState};
    use crate::error::InstrumentError;
    use crate::filter::Capabilities;
    use crate::instrument::{TriggerMode, TriggerStatus};
    use crate::filters::Rms;
    use crate::mock::MockInstrument;

    fn screen(status: &Status) -> String {
        let area = Rect::new(0, 0, 100, 24);
        let mut buf = Buffer::empty(area);
        status.render(area, &mut buf);
        buf.content.iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn renders_instruments_and_filters() {
        let mut session = Session::new(AcquisitionSettings::default(), Capabilities::cpu_only());
        session
            .add_instrument(Box::new(MockInstrument::new("bench", 1, 8, 1_000)))
            .unwrap();
        session.add_filter("level", Box::new(Rms::new())).unwrap();
        let status = Status::new(session);

        let text = screen(&status);
        assert!(text.contains("bench"));
        assert!(text.contains("idle"));
        assert!(text.contains("level"));
        assert!(text.contains("pending"));
    }

    #[test]
    fn keys_move_selection_and_quit() {
        let mut session = Session::new(AcquisitionSettings::default(), Capabilities::cpu_only());
        for name in ["a", "b"] {
            session
                .add_instrument(Box::new(MockInstrument::new(name, 1, 8, 1_000)))
                .unwrap();
        }
        let mut status = Status::new(session);
        status.handle_key_event(KeyEvent::from(KeyCode::Down));
        status.handle_key_event(KeyEvent::from(KeyCode::Down));
        assert_eq!(status.selected, 1);
        status.handle_key_event(KeyEvent::from(KeyCode::Char('q')));
        assert!(status.exit);
    }

    fn quick() -> AcquisitionSettings {
        AcquisitionSettings {
            poll_interval: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            failure_threshold: 1,
            max_pending: 2,
        }
    }

    #[test]
    fn headless_stops_after_single_capture() {
        let mut session = Session::new(quick(), Capabilities::cpu_only());
        let id = session
            .add_instrument(Box::new(MockInstrument::new("bench", 1, 8, 1_000)))
            .unwrap();
        session.set_trigger_mode(TriggerMode::Single);
        assert_eq!(run_headless(&mut session, 2).unwrap(), 1);
        assert_eq!(session.instrument_state(id), Some(AcquisitionState::Idle));
    }

    #[test]
    fn headless_stops_when_every_instrument_disconnects() {
        let mut session = Session::new(quick(), Capabilities::cpu_only());
        let flaky = MockInstrument::new("bench", 1, 8, 1_000).with_poll_script(
            vec![Err(InstrumentError::Transport("link down".into()))],
            TriggerStatus::Triggered,
        );
        let id = session.add_instrument(Box::new(flaky)).unwrap();
        assert_eq!(run_headless(&mut session, 5).unwrap(), 0);
        assert_eq!(session.instrument_state(id), Some(AcquisitionState::Disconnected));
    }
}
