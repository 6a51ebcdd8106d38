mod event;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use crossterm::event::{KeyCode, KeyModifiers};
use crossterm::{cursor, execute, queue, terminal};
use serde_json::Value;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use stockdesk::api::{AbortSignal, CollectionApi, HttpCollectionApi, Patch};
use stockdesk::breaker::{CircuitPhase, CircuitSnapshot};
use stockdesk::cache::Entity;
use stockdesk::clock::{Clock, TokioClock};
use stockdesk::config::Config;
use stockdesk::filters::{FilterContext, StockFilter};
use stockdesk::model::Product;
use stockdesk::prefs::{MemoryPreferences, PreferenceStore, SqlitePreferences};
use stockdesk::search::{Debouncer, KeyResult, SearchField};
use stockdesk::store::{CollectionStore, Loaded, StoreOptions};

use event::{Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "stockdesk")]
#[command(about = "Inventory browser with a resilient API layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stockdesk/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Interactive browser with live search (default)
  Browse,
  /// Print product pages
  List {
    #[arg(short, long, default_value_t = 1)]
    page: u32,
    /// Number of consecutive pages to print
    #[arg(long, default_value_t = 1)]
    pages: u32,
    #[arg(long)]
    category: Option<String>,
    /// all, in_stock, low_stock or out_of_stock
    #[arg(long)]
    stock: Option<String>,
  },
  /// Search products by name or SKU
  Search { term: String },
  /// Change fields of a product: `update P1 name=Drill stock=4`
  Update {
    id: String,
    #[arg(required = true)]
    fields: Vec<String>,
    /// Page the product is on
    #[arg(short, long, default_value_t = 1)]
    page: u32,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
  let api: Arc<dyn CollectionApi<Product>> = Arc::new(HttpCollectionApi::<Product>::new(
    &config.api,
    Product::collection(),
  )?);
  let prefs: Arc<dyn PreferenceStore> = match SqlitePreferences::open() {
    Ok(prefs) => Arc::new(prefs),
    Err(e) => {
      warn!(error = %e, "preferences unavailable, filters will not persist");
      Arc::new(MemoryPreferences::new())
    }
  };
  let store = CollectionStore::new(api, Arc::clone(&clock), prefs, StoreOptions::from_config(&config));
  info!(base_url = %config.api.base_url, "store ready");

  match args.command.unwrap_or(Command::Browse) {
    Command::Browse => browse(&config, clock, store).await,
    Command::List {
      page,
      pages,
      category,
      stock,
    } => list(&config, &store, page, pages, category, stock).await,
    Command::Search { term } => search(&store, &term).await,
    Command::Update { id, fields, page } => update(&config, &store, &id, &fields, page).await,
  }
}

/// Log to a daily file under the data directory; warnings also go to stderr.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("stockdesk")
    .join("logs");
  std::fs::create_dir_all(&dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "stockdesk.log"));
  let env_filter = EnvFilter::try_from_env("STOCKDESK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .with(
      fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(LevelFilter::WARN),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

// ============================================================================
// One-shot commands
// ============================================================================

async fn list(
  config: &Config,
  store: &CollectionStore<Product>,
  page: u32,
  pages: u32,
  category: Option<String>,
  stock: Option<String>,
) -> Result<()> {
  let stock_filter = match stock {
    Some(value) => StockFilter::parse(&value).ok_or_else(|| eyre!("Unknown stock filter: {}", value))?,
    None => store.filters().stock_filter,
  };
  store.set_filters(FilterContext {
    search_term: String::new(),
    category: category.or_else(|| store.filters().category),
    stock_filter,
  });

  for current in page..page.saturating_add(pages.max(1)) {
    match store.fetch_page(current, config.page_size).await? {
      Loaded::Data(products) => {
        // Warm the next page while this one prints.
        let prefetch = store.prefetch_next_page();
        let pagination = store.pagination();
        println!("-- page {}/{} --", pagination.page, pagination.total_pages.max(1));
        print_products(&products);
        if let Some(handle) = prefetch {
          let _ = handle.await;
        }
        if current >= pagination.total_pages {
          break;
        }
      }
      Loaded::CircuitOpen => {
        print_circuit(store.circuit());
        break;
      }
      Loaded::Superseded => break,
    }
  }
  Ok(())
}

async fn search(store: &CollectionStore<Product>, term: &str) -> Result<()> {
  match store.search(term, AbortSignal::new()).await? {
    Loaded::Data(products) if products.is_empty() => println!("No products match {:?}", term.trim()),
    Loaded::Data(products) => print_products(&products),
    Loaded::CircuitOpen => print_circuit(store.circuit()),
    Loaded::Superseded => {}
  }
  Ok(())
}

async fn update(
  config: &Config,
  store: &CollectionStore<Product>,
  id: &str,
  fields: &[String],
  page: u32,
) -> Result<()> {
  let patch = parse_patch(fields)?;
  store.fetch_page(page, config.page_size).await?;

  if store.optimistic_update(id, patch).await? {
    if let Some(product) = store.entity(id) {
      print_products(&[product]);
    }
    Ok(())
  } else {
    Err(eyre!(
      "Update rejected: {}",
      store.error().unwrap_or_else(|| "unknown error".to_string())
    ))
  }
}

/// Parse `field=value` pairs; values are JSON where they parse as such.
fn parse_patch(fields: &[String]) -> Result<Patch> {
  let mut patch = Patch::new();
  for field in fields {
    let (key, raw) = field
      .split_once('=')
      .ok_or_else(|| eyre!("Expected field=value, got {:?}", field))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    patch.insert(key.trim().to_string(), value);
  }
  Ok(patch)
}

fn print_products(products: &[Product]) {
  for line in product_lines(products) {
    println!("{}", line);
  }
}

fn product_lines(products: &[Product]) -> Vec<String> {
  products
    .iter()
    .map(|p| {
      format!(
        "{:<10} {:<36} {:>6}  {}",
        p.id,
        p.name,
        p.stock.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
        p.category.as_deref().unwrap_or("")
      )
    })
    .collect()
}

fn circuit_label(circuit: &CircuitSnapshot, clock: &dyn Clock) -> String {
  match (circuit.phase, circuit.open_until) {
    (CircuitPhase::Open, Some(until)) => {
      let remaining = until.saturating_sub(clock.now_ms());
      let retry_at = chrono::Local::now() + chrono::Duration::milliseconds(remaining as i64);
      format!("open, retrying after {}", retry_at.format("%H:%M:%S"))
    }
    (CircuitPhase::HalfOpen, _) => "half-open".to_string(),
    _ if circuit.failures > 0 => format!("closed ({} recent failures)", circuit.failures),
    _ => "closed".to_string(),
  }
}

fn print_circuit(circuit: CircuitSnapshot) {
  println!(
    "Service unavailable: circuit open after {} failures, nothing was requested",
    circuit.failures
  );
}

// ============================================================================
// Interactive browser
// ============================================================================

async fn browse(config: &Config, clock: Arc<dyn Clock>, store: CollectionStore<Product>) -> Result<()> {
  let debouncer = Debouncer::new(config.search, Arc::clone(&clock), Arc::new(store.clone()));
  let mut field = SearchField::new(debouncer);
  store.on_filters_changed(field.debouncer().interrupter());

  let mut stdout = io::stdout();
  terminal::enable_raw_mode()?;
  execute!(stdout, terminal::EnterAlternateScreen, cursor::Hide)?;

  let result = browse_loop(config, clock.as_ref(), &store, &mut field, &mut stdout).await;

  execute!(stdout, cursor::Show, terminal::LeaveAlternateScreen)?;
  terminal::disable_raw_mode()?;
  result
}

async fn browse_loop(
  config: &Config,
  clock: &dyn Clock,
  store: &CollectionStore<Product>,
  field: &mut SearchField,
  stdout: &mut io::Stdout,
) -> Result<()> {
  let mut events = EventHandler::new(Duration::from_millis(100));
  spawn_load(store, 1, config.page_size);

  while let Some(event) = events.next().await {
    if let Event::Key(key) = event {
      let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
      match key.code {
        KeyCode::Char('c') if ctrl => break,
        KeyCode::PageDown => {
          let pagination = store.pagination();
          if pagination.page < pagination.total_pages {
            spawn_load(store, pagination.page + 1, pagination.page_size);
          }
        }
        KeyCode::PageUp => {
          let pagination = store.pagination();
          if pagination.page > 1 {
            spawn_load(store, pagination.page - 1, pagination.page_size);
          }
        }
        KeyCode::Tab => {
          store.set_stock_filter(next_stock_filter(store.filters().stock_filter));
          spawn_load(store, 1, store.pagination().page_size);
        }
        KeyCode::Char('r') if ctrl => {
          store.clear_error();
          store.reset_circuit();
          let pagination = store.pagination();
          spawn_load(store, pagination.page, pagination.page_size);
        }
        _ => {
          if let KeyResult::NotHandled = field.handle_key(key) {
            continue;
          }
        }
      }
    }
    render(clock, store, field, stdout)?;
  }
  Ok(())
}

fn next_stock_filter(current: StockFilter) -> StockFilter {
  match current {
    StockFilter::All => StockFilter::InStock,
    StockFilter::InStock => StockFilter::LowStock,
    StockFilter::LowStock => StockFilter::OutOfStock,
    StockFilter::OutOfStock => StockFilter::All,
  }
}

/// Load a page in the background, then warm the one after it.
fn spawn_load(store: &CollectionStore<Product>, page: u32, page_size: u32) {
  let store = store.clone();
  tokio::spawn(async move {
    if let Ok(Loaded::Data(_)) = store.fetch_page(page, page_size).await {
      let _ = store.prefetch_next_page();
    }
  });
}

fn render(
  clock: &dyn Clock,
  store: &CollectionStore<Product>,
  field: &SearchField,
  stdout: &mut io::Stdout,
) -> Result<()> {
  let pagination = store.pagination();
  let filters = store.filters();
  let mut lines = vec![
    format!(
      "stockdesk  products  page {}/{}  stock: {:?}  circuit: {}{}",
      pagination.page,
      pagination.total_pages.max(1),
      filters.stock_filter,
      circuit_label(&store.circuit(), clock),
      if store.is_loading() { "  loading..." } else { "" }
    ),
    format!("search: {}", field.value()),
    match store.error() {
      Some(error) => format!("error: {}", error),
      None => String::new(),
    },
  ];
  lines.extend(product_lines(&store.entities()));
  lines.push(String::new());
  lines.push("PgUp/PgDn page  Tab stock filter  Enter search  Esc clear  Ctrl-R retry  Ctrl-C quit".to_string());

  queue!(stdout, cursor::MoveTo(0, 0), terminal::Clear(terminal::ClearType::All))?;
  for line in lines {
    write!(stdout, "{}\r\n", line)?;
  }
  stdout.flush()?;
  Ok(())
}
