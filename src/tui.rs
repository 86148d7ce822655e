use crate::{Host, OperatingMode, SessionView};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::error;
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub channel: usize,
    pub entries: u64,
    pub last_height: Option<f64>,
    pub last_timestamp: Option<u64>,
}

/// What the status screen shows, copied out of a [`SessionView`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub board_id: usize,
    pub mode: OperatingMode,
    pub elapsed: Duration,
    pub run_duration: Option<Duration>,
    pub events: u64,
    pub skipped: u64,
    pub rate: f64,
    pub channels: Vec<ChannelSummary>,
}

impl RunSummary {
    pub fn from_view(view: &SessionView<'_>) -> Self {
        let channels = (0..view.histograms.num_channels())
            .filter_map(|ch| {
                let entries = view.histograms.spectrum(ch)?.entries();
                let last = view.last_events.get(ch).and_then(Option::as_ref);
                (entries > 0 || last.is_some()).then(|| ChannelSummary {
                    channel: ch,
                    entries,
                    last_height: last.map(|e| e.height),
                    last_timestamp: last.map(|e| e.timestamp),
                })
            })
            .collect();
        Self {
            board_id: view.board_id,
            mode: view.mode,
            elapsed: view.elapsed,
            run_duration: view.run_duration,
            events: view.events,
            skipped: view.skipped,
            rate: view.counter.rate(),
            channels,
        }
    }
}

/// Terminal status display; pressing `q` clears the acquisition enable flag.
pub struct Status {
    terminal: DefaultTerminal,
    enable: Arc<AtomicBool>,
    ticker: Receiver<Instant>,
    summary: Option<RunSummary>,
    pub exit: Option<StatusExit>,
}

impl Status {
    pub fn new(terminal: DefaultTerminal, enable: Arc<AtomicBool>) -> Self {
        Self {
            terminal,
            enable,
            ticker: tick(Duration::from_millis(250)),
            summary: None,
            exit: None,
        }
    }

    fn draw(&mut self) -> Result<()> {
        if let Some(summary) = &self.summary {
            self.terminal
                .draw(|frame: &mut Frame| frame.render_widget(summary, frame.area()))?;
        }
        Ok(())
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit();
        }
    }

    fn exit(&mut self) {
        self.exit = Some(StatusExit::Quit);
        self.enable.store(false, Ordering::SeqCst);
    }
}

impl Host for Status {
    fn process_events(&mut self, view: &SessionView<'_>) {
        if let Err(e) = self.handle_events() {
            error!("terminal input failed, stopping: {e}");
            self.exit();
        }
        if self.ticker.try_recv().is_ok() {
            self.summary = Some(RunSummary::from_view(view));
            if let Err(e) = self.draw() {
                error!("terminal draw failed, stopping: {e}");
                self.exit();
            }
        }
    }
}

impl Widget for &RunSummary {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" Board {} {:?} ", self.board_id, self.mode).bold());
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let limit = match self.run_duration {
            Some(d) => format!(" / {} s", d.as_secs()),
            None => String::new(),
        };
        let mut lines = vec![Line::from(vec![
            "Elapsed time: ".into(),
            self.elapsed.as_secs().to_string().yellow(),
            format!(" s{limit}").into(),
            " Events: ".into(),
            self.events.to_string().yellow(),
            " Skipped: ".into(),
            self.skipped.to_string().yellow(),
            " Data rate: ".into(),
            format!("{:.2}", self.rate).yellow(),
            " MB/s".into(),
        ])];
        for ch in &self.channels {
            lines.push(Line::from(vec![
                format!("ch{:<2} ", ch.channel).bold(),
                "entries ".into(),
                ch.entries.to_string().yellow(),
                "  last height ".into(),
                ch.last_height
                    .map_or("-".to_string(), |h| format!("{h:.1}"))
                    .yellow(),
                "  time tag ".into(),
                ch.last_timestamp
                    .map_or("-".to_string(), |t| t.to_string())
                    .yellow(),
            ]));
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}
