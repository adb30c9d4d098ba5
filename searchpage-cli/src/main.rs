use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use searchpage_core::{
  AggregationSpec, ClientOptions, Expression, InMemoryBackend, PageRequest, SearchClient,
  SearchResult, SortSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Parser)]
#[command(
  name = "searchpage",
  version,
  about = "Run searches, aggregations and paginated scans over a JSONL dataset"
)]
struct Cli {
  /// JSONL file with one document per line
  #[arg(long, global = true)]
  data: Option<PathBuf>,
  /// Index name the documents are loaded under
  #[arg(long, global = true, default_value = "docs")]
  index: String,
  /// Document field used as `_id` (line number when absent)
  #[arg(long, global = true)]
  id_field: Option<String>,
  /// Client options JSON (timeout_ms, max_result_window, track_total_hits)
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch a page of hits; the request file holds query, page and sort
  Search {
    #[arg(long)]
    request: Option<PathBuf>,
    #[arg(long, conflicts_with = "request")]
    request_stdin: bool,
    /// Follow cursors until the result set is drained
    #[arg(long)]
    all: bool,
  },
  /// Run an aggregation tree; the request file holds the spec and an optional filter
  Aggregate {
    #[arg(long)]
    request: PathBuf,
  },
  /// Count documents matching the expression in the request file
  Count {
    #[arg(long)]
    request: Option<PathBuf>,
  },
  /// Completion suggestions for a prefix
  Suggest {
    #[arg(long)]
    field: String,
    #[arg(long)]
    prefix: String,
    #[arg(long, default_value_t = 5)]
    size: u32,
  },
}

#[derive(Debug, Serialize, Deserialize)]
struct SearchFile {
  #[serde(default = "match_all")]
  query: Expression,
  page: PageRequest,
  #[serde(default)]
  sort: SortSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct AggregateFile {
  aggregation: AggregationSpec,
  #[serde(default)]
  filter: Option<Expression>,
}

fn match_all() -> Expression {
  Expression::MatchAll
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(io::stderr)
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .init();
  let cli = Cli::parse();
  let client = build_client(
    cli.data.as_deref(),
    &cli.index,
    cli.id_field.as_deref(),
    cli.config.as_deref(),
  )?;
  let output = match cli.command {
    Commands::Search {
      request,
      request_stdin,
      all,
    } => {
      let request = read_search_request(request, request_stdin)?;
      let pages = cmd_search(&client, &cli.index, request, all)?;
      if all {
        serde_json::to_value(pages)?
      } else {
        serde_json::to_value(pages.into_iter().next())?
      }
    }
    Commands::Aggregate { request } => {
      let request: AggregateFile = read_json(&request)?;
      let result = client.aggregate(&cli.index, &request.aggregation, request.filter.as_ref())?;
      serde_json::to_value(result)?
    }
    Commands::Count { request } => {
      let expr = match request {
        Some(path) => read_json(&path)?,
        None => Expression::MatchAll,
      };
      Value::from(client.count(&cli.index, &expr)?)
    }
    Commands::Suggest {
      field,
      prefix,
      size,
    } => serde_json::to_value(client.suggest(&cli.index, &field, &prefix, size)?)?,
  };
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

fn build_client(
  data: Option<&Path>,
  index: &str,
  id_field: Option<&str>,
  config: Option<&Path>,
) -> Result<SearchClient<InMemoryBackend>> {
  let options: ClientOptions = match config {
    Some(path) => read_json(path)?,
    None => ClientOptions::default(),
  };
  let backend = InMemoryBackend::new().with_max_result_window(options.max_result_window);
  match data {
    Some(path) => {
      let loaded = load_documents(&backend, index, id_field, path)?;
      info!(index, loaded, "documents loaded");
    }
    None => bail!("--data is required: there is no remote backend to query"),
  }
  Ok(SearchClient::with_options(backend, options))
}

fn load_documents(
  backend: &InMemoryBackend,
  index: &str,
  id_field: Option<&str>,
  path: &Path,
) -> Result<usize> {
  let content =
    fs::read_to_string(path).with_context(|| format!("reading documents from {:?}", path))?;
  let mut docs = Vec::new();
  for (line_no, line) in content.lines().enumerate() {
    if line.trim().is_empty() {
      continue;
    }
    let value: Value = serde_json::from_str(line)
      .with_context(|| format!("invalid JSON on line {}", line_no + 1))?;
    if !value.is_object() {
      bail!("line {} is not a JSON object", line_no + 1);
    }
    docs.push(value);
  }
  backend.insert_many(index, id_field, docs)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let contents = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
  serde_json::from_str(&contents).with_context(|| format!("parsing JSON from {:?}", path))
}

fn read_search_request(path: Option<PathBuf>, request_stdin: bool) -> Result<SearchFile> {
  if let Some(p) = path {
    return read_json(&p);
  }
  if request_stdin {
    let mut buf = String::new();
    io::stdin()
      .read_to_string(&mut buf)
      .context("reading search request from stdin")?;
    return serde_json::from_str(&buf).context("parsing search request JSON from stdin");
  }
  Ok(SearchFile {
    query: Expression::MatchAll,
    page: PageRequest::offset(0, 10),
    sort: SortSpec::none(),
  })
}

/// Runs one page, or with `all` every page until the cursor runs out. Scroll
/// snapshots opened along the way are cleared before returning.
fn cmd_search(
  client: &SearchClient<InMemoryBackend>,
  index: &str,
  request: SearchFile,
  all: bool,
) -> Result<Vec<SearchResult>> {
  let SearchFile {
    query,
    mut page,
    sort,
  } = request;
  let mut pages = Vec::new();
  let mut scroll_id = None;
  loop {
    let result = client.search(index, &query, &page, &sort)?;
    if result.scroll_id.is_some() {
      scroll_id = result.scroll_id.clone();
    }
    let next = result.next_page(&page);
    let exhausted = result.is_exhausted();
    if !(all && exhausted) || pages.is_empty() {
      pages.push(result);
    }
    match next {
      Some(next) if all => page = next,
      _ => break,
    }
  }
  if all {
    if let Some(id) = scroll_id {
      let freed = client.clear_scroll(&id)?;
      debug!(scroll_id = %id, freed, "cleared scroll");
    }
  }
  Ok(pages)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tempfile::tempdir;

  fn dataset(dir: &Path) -> PathBuf {
    let path = dir.join("people.jsonl");
    let lines: Vec<String> = (0..7)
      .map(|i| format!("{{\"id\":\"p{i}\",\"age\":{}}}", 20 + i))
      .collect();
    fs::write(&path, lines.join("\n")).unwrap();
    path
  }

  #[test]
  fn loads_jsonl_and_pages_with_offset() {
    let dir = tempdir().unwrap();
    let data = dataset(dir.path());
    let client = build_client(Some(&data), "people", Some("id"), None).unwrap();
    let pages = cmd_search(
      &client,
      "people",
      SearchFile {
        query: Expression::MatchAll,
        page: PageRequest::offset(0, 3),
        sort: SortSpec::none(),
      },
      true,
    )
    .unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].total, 7);
    assert_eq!(pages[0].total_pages, 3);
  }

  #[test]
  fn follows_scroll_to_the_end_and_clears_it() {
    let dir = tempdir().unwrap();
    let data = dataset(dir.path());
    let client = build_client(Some(&data), "people", Some("id"), None).unwrap();
    let pages = cmd_search(
      &client,
      "people",
      SearchFile {
        query: Expression::MatchAll,
        page: PageRequest::scroll(3, Duration::from_secs(30)),
        sort: SortSpec::none(),
      },
      true,
    )
    .unwrap();
    let sizes: Vec<usize> = pages.iter().map(|p| p.items.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(client.backend().open_scrolls(), 0);
  }

  #[test]
  fn search_request_file_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("request.json");
    fs::write(
      &path,
      r#"{"query": {"type": "term", "field": "age", "value": 21},
          "page": {"strategy": "offset", "from": 0, "size": 5}}"#,
    )
    .unwrap();
    let request = read_search_request(Some(path), false).unwrap();
    assert_eq!(request.query, Expression::term("age", 21));
    assert!(request.sort.is_empty());
  }

  #[test]
  fn config_sets_the_result_window() {
    let dir = tempdir().unwrap();
    let data = dataset(dir.path());
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"max_result_window": 4}"#).unwrap();
    let client = build_client(Some(&data), "people", None, Some(&config)).unwrap();
    assert_eq!(client.options().max_result_window, 4);
    let err = cmd_search(
      &client,
      "people",
      SearchFile {
        query: Expression::MatchAll,
        page: PageRequest::offset(2, 3),
        sort: SortSpec::none(),
      },
      false,
    )
    .unwrap_err();
    assert!(err.to_string().contains("window"), "unexpected error: {err}");
  }

  #[test]
  fn missing_data_is_reported() {
    let err = build_client(None, "people", None, None).err().unwrap();
    assert!(err.to_string().contains("--data"));
  }

  #[test]
  fn rejects_non_object_lines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.jsonl");
    fs::write(&path, "{\"a\":1}\n[1,2]\n").unwrap();
    let backend = InMemoryBackend::new();
    let err = load_documents(&backend, "x", None, &path).unwrap_err();
    assert!(err.to_string().contains("line 2"));
  }
}
