//! Overview (nodes and the tasks they hold)
//! Queue (available tasks in claim order)
//! Completed (finished tasks, newest first)

use std::{
  error::Error,
  io,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};

use swarmledger::config::Config;
use swarmledger::ledger_store::LedgerStore;
use swarmledger::models::{Ledger, NodeStatus, Task, TaskStatus};
use swarmledger::node_registry;
use swarmledger::task_queue;

const REFRESH: Duration = Duration::from_secs(2);

struct NodeInfo {
  node_id: String,
  status: NodeStatus,
  active: bool,
  capacity: u8,
  current_task: Option<String>,
  last_seen: DateTime<Utc>,
  completed_tasks: u64,
}

struct TaskInfo {
  id: String,
  title: String,
  priority: f64,
  node: Option<String>,
  at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Completed,
}

struct App {
  current_tab: DashboardTab,
  loaded: bool,
  nodes: Vec<NodeInfo>,
  claimed: Vec<TaskInfo>,
  queued: Vec<TaskInfo>,
  completed: Vec<TaskInfo>,
  last_updated: Option<DateTime<Utc>>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      loaded: false,
      nodes: vec![],
      claimed: vec![],
      queued: vec![],
      completed: vec![],
      last_updated: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Completed,
      DashboardTab::Completed => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Completed,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Completed => DashboardTab::Queue,
    }
  }

  /// Replaces the data, keeping the selected tab.
  fn refresh(&mut self, next: App) {
    let tab = self.current_tab;
    *self = next;
    self.current_tab = tab;
  }
}

impl TaskInfo {
  fn from_task(task: &Task) -> Self {
    let (node, at) = match task.status {
      TaskStatus::Completed => (task.completed_by.clone(), task.completed_at),
      _ => (task.claimed_by.clone(), task.claimed_at),
    };
    Self { id: task.id.clone(), title: task.title.clone(), priority: task.priority, node, at }
  }
}

fn read_state(ledger: Ledger, horizon: Duration) -> App {
  let now = Utc::now();
  let mut app = App::new();
  app.loaded = true;
  app.last_updated = Some(ledger.last_updated);
  app.nodes = ledger
    .nodes
    .values()
    .map(|n| NodeInfo {
      node_id: n.id.clone(),
      status: n.status,
      active: node_registry::is_active(n, horizon, now),
      capacity: n.capacity,
      current_task: n.current_task.clone(),
      last_seen: n.last_seen,
      completed_tasks: n.completed_tasks,
    })
    .collect();
  app.nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
  app.claimed = ledger
    .tasks
    .iter()
    .filter(|t| t.status == TaskStatus::Claimed)
    .map(TaskInfo::from_task)
    .collect();
  app.queued = task_queue::claim_order(&ledger).into_iter().map(TaskInfo::from_task).collect();
  app.completed = ledger
    .tasks
    .iter()
    .filter(|t| t.status == TaskStatus::Completed)
    .map(TaskInfo::from_task)
    .collect();
  app.completed.sort_by(|a, b| b.at.cmp(&a.at));
  app
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env();
  let store = LedgerStore::new(config.ledger_path.clone());
  let horizon = config.node_stale_after;

  let (tx, rx) = mpsc::channel::<App>();
  thread::spawn(move || loop {
    let state = store.snapshot().map(|l| read_state(l, horizon)).unwrap_or_else(App::new);
    if tx.send(state).is_err() {
      break;
    }
    thread::sleep(REFRESH);
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let result = run(&mut terminal, &rx);

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  result
}

fn run<B: Backend>(terminal: &mut Terminal<B>, rx: &mpsc::Receiver<App>) -> Result<(), Box<dyn Error>> {
  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Some(state) = rx.try_iter().last() {
      app.refresh(state);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => return Ok(()),
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Overview", "Queue", "Completed"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title(title(app)))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Completed => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Completed => render_completed(f, app, chunks[1]),
  }

  let footer = Paragraph::new("←/→: Switch Tabs | q: Quit")
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn title(app: &App) -> String {
  match (app.loaded, app.last_updated) {
    (true, Some(at)) => format!("Swarm Ledger (updated {})", at.format("%Y-%m-%d %H:%M:%S")),
    _ => "Swarm Ledger (no ledger yet)".into(),
  }
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
  at.map_or_else(|| "N/A".into(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let active = app.nodes.iter().filter(|n| n.active).count();
  let node_items: Vec<ListItem> = app.nodes.iter().map(|n| {
    let colour = match (n.active, n.status) {
      (false, _) | (_, NodeStatus::Offline) => Color::DarkGray,
      (_, NodeStatus::Working) => Color::Green,
      (_, NodeStatus::Idle) => Color::White,
    };
    let lines = vec![
      Spans::from(Span::styled(format!("ID: {}", n.node_id), Style::default().fg(colour).add_modifier(Modifier::BOLD))),
      Spans::from(Span::raw(format!("Status: {} | Battery: {}% | Done: {}", n.status, n.capacity, n.completed_tasks))),
      Spans::from(Span::raw(format!("Task: {}", n.current_task.as_deref().unwrap_or("none")))),
      Spans::from(Span::raw(format!("Last seen: {}", timestamp(Some(n.last_seen))))),
    ];
    ListItem::new(lines)
  }).collect();

  let nodes_list = List::new(node_items)
    .block(Block::default().borders(Borders::ALL).title(format!("Nodes ({} active / {} total)", active, app.nodes.len())));
  f.render_widget(nodes_list, chunks[0]);

  let claimed: Vec<ListItem> = app.claimed.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::raw(format!("{}: {} (since {})", t.node.as_deref().unwrap_or("?"), t.id, timestamp(t.at)))
    ]))
  }).collect();
  let tasks_list = List::new(if claimed.is_empty() { vec![ListItem::new(Spans::from(Span::raw("No claimed tasks")))] } else { claimed })
    .block(Block::default().borders(Borders::ALL).title("Claimed Tasks"));
  f.render_widget(tasks_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.queued.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("Priority: {} | {}", t.priority, t.title))
    ]))
  }).collect();
  let header = format!("Available Tasks in Claim Order ({})", app.queued.len());
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_completed<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.completed.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(timestamp(t.at), Style::default().fg(Color::Green)),
      Span::raw(" - "),
      Span::raw(format!("{} by {}", t.id, t.node.as_deref().unwrap_or("unknown"))),
    ]))
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title(format!("Completed Tasks ({})", app.completed.len())));
  f.render_widget(list, area);
}
