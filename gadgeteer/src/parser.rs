//! Incremental parser for the gadget marker protocol.
//!
//! Model replies arrive as string chunks of arbitrary, unaligned length. The
//! parser recovers gadget invocations from marker blocks while emitting the
//! surrounding prose incrementally:
//!
//! ```text
//! !!!GADGET_START:Calculator:gc_1:dep_a,dep_b
//! !!!ARG:op
//! add
//! !!!ARG:a
//! 2
//! !!!GADGET_END:
//! ```
//!
//! Prose belonging inside a block is never emitted, and a marker split across
//! chunk boundaries is held back until it can be classified. Argument paths
//! use JSON-pointer syntax with `/` separators; numeric segments address
//! array elements. Values are taken verbatim — type coercion happens later,
//! against the target gadget's schema.
//!
//! One parser instance handles exactly one model response; the controller
//! creates a fresh one per LLM call.

use serde_json::{Map, Value};

/// Marker prefixes for the invocation grammar. All three are configurable;
/// the defaults match the wire format gadget-aware prompts describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConfig {
    /// Opens an invocation header, e.g. `!!!GADGET_START:`.
    pub start_prefix: String,
    /// Closes an invocation body, e.g. `!!!GADGET_END:`.
    pub end_prefix: String,
    /// Introduces a parameter, e.g. `!!!ARG:`.
    pub arg_prefix: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start_prefix: "!!!GADGET_START:".to_owned(),
            end_prefix: "!!!GADGET_END:".to_owned(),
            arg_prefix: "!!!ARG:".to_owned(),
        }
    }
}

/// One gadget invocation recovered from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct GadgetCall {
    /// The gadget the model asked for.
    pub gadget_name: String,
    /// Stable id within the response (`gc_<n>` when the model omitted one).
    pub invocation_id: String,
    /// Peer invocation ids this call must wait on.
    pub dependencies: Vec<String>,
    /// The verbatim body between the start and end markers.
    pub raw_args: String,
    /// Decoded parameter mapping. Values are strings until schema coercion.
    pub args: Value,
    /// Set when the block could not be decoded; such a call never executes.
    pub parse_error: Option<String>,
    /// Id of the model response this call came from.
    pub response_id: String,
}

impl GadgetCall {
    /// Reconstruct the marker block, for synthetic conversation history.
    #[must_use]
    pub fn render(&self, config: &MarkerConfig) -> String {
        let mut block = String::new();
        block.push_str(&config.start_prefix);
        block.push_str(&self.gadget_name);
        block.push(':');
        block.push_str(&self.invocation_id);
        if !self.dependencies.is_empty() {
            block.push(':');
            block.push_str(&self.dependencies.join(","));
        }
        block.push('\n');
        if !self.raw_args.is_empty() {
            block.push_str(&self.raw_args);
            block.push('\n');
        }
        block.push_str(&config.end_prefix);
        block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Prose,
    AwaitingHeader,
    InBody,
    InArg,
}

#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    id: String,
    deps: Vec<String>,
    body_lines: Vec<String>,
    params: Vec<(String, String)>,
    current_path: Option<String>,
    current_value: Vec<String>,
    error: Option<String>,
}

impl PendingCall {
    fn close_arg(&mut self) {
        if let Some(path) = self.current_path.take() {
            let value = strip_value_fences(&self.current_value).join("\n");
            self.params.push((path, value));
            self.current_value.clear();
        }
    }
}

/// Drop a markdown fence pair wrapping an entire argument value.
fn strip_value_fences(lines: &[String]) -> &[String] {
    if lines.len() >= 2
        && is_fence(lines.first().map_or("", String::as_str))
        && lines.last().map_or("", String::as_str).trim() == "```"
    {
        &lines[1..lines.len() - 1]
    } else {
        lines
    }
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("```") && !trimmed[3..].contains('`')
}

/// The streaming marker parser.
///
/// Feed chunks with [`feed`](MarkerParser::feed), collecting the prose it
/// returns; call [`finish`](MarkerParser::finish) at end of stream for the
/// prose tail and the extracted invocations. Splitting the input at any byte
/// boundary yields the same result as feeding it whole.
#[derive(Debug)]
pub struct MarkerParser {
    config: MarkerConfig,
    response_id: String,
    mode: Mode,
    buf: String,
    current: Option<PendingCall>,
    calls: Vec<GadgetCall>,
    auto_counter: usize,
}

impl MarkerParser {
    /// Create a parser for one model response.
    #[must_use]
    pub fn new(config: MarkerConfig, response_id: impl Into<String>) -> Self {
        Self {
            config,
            response_id: response_id.into(),
            mode: Mode::Prose,
            buf: String::new(),
            current: None,
            calls: Vec::new(),
            auto_counter: 0,
        }
    }

    /// Number of invocations finalized so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    /// Consume a chunk, returning any prose that is now safe to emit.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buf.push_str(chunk);
        let mut prose = String::new();

        loop {
            match self.mode {
                Mode::Prose => {
                    if let Some(idx) = self.buf.find(&self.config.start_prefix) {
                        prose.push_str(&self.buf[..idx]);
                        self.buf.drain(..idx + self.config.start_prefix.len());
                        self.mode = Mode::AwaitingHeader;
                    } else {
                        // Hold the longest tail that could still become a
                        // start marker; everything before it is prose.
                        let hold = longest_marker_suffix(&self.buf, &self.config.start_prefix);
                        let safe = self.buf.len() - hold;
                        prose.push_str(&self.buf[..safe]);
                        self.buf.drain(..safe);
                        break;
                    }
                }
                Mode::AwaitingHeader => {
                    let Some(nl) = self.buf.find('\n') else { break };
                    let header = self.buf[..nl].trim_end_matches('\r').to_owned();
                    self.buf.drain(..=nl);
                    self.open_invocation(&header);
                    self.mode = Mode::InBody;
                }
                Mode::InBody | Mode::InArg => {
                    let Some(nl) = self.buf.find('\n') else { break };
                    let line = self.buf[..nl].trim_end_matches('\r').to_owned();
                    self.buf.drain(..=nl);
                    self.dispatch_body_line(line);
                }
            }
        }

        prose
    }

    /// Close the stream: returns the remaining prose and the invocations.
    ///
    /// An invocation still open at end of stream is captured with a parse
    /// error so the failure is visible to the model next iteration.
    #[must_use]
    pub fn finish(mut self) -> (String, Vec<GadgetCall>) {
        // A final line may arrive without a trailing newline.
        if !self.buf.is_empty() {
            match self.mode {
                Mode::AwaitingHeader => {
                    let header = std::mem::take(&mut self.buf);
                    self.open_invocation(header.trim_end_matches('\r'));
                    self.mode = Mode::InBody;
                }
                Mode::InBody | Mode::InArg => {
                    let line = std::mem::take(&mut self.buf);
                    self.dispatch_body_line(line.trim_end_matches('\r').to_owned());
                }
                Mode::Prose => {}
            }
        }

        let mut prose = String::new();
        match self.mode {
            Mode::Prose => prose.push_str(&self.buf),
            Mode::AwaitingHeader | Mode::InBody | Mode::InArg => {
                if let Some(mut pending) = self.current.take() {
                    pending.close_arg();
                    pending.error.get_or_insert_with(|| {
                        "unterminated invocation: end of response before closing marker".to_owned()
                    });
                    self.finalize(pending);
                } else {
                    // The start marker appeared but the header never
                    // completed; capture the fragment as a broken call.
                    let fragment = std::mem::take(&mut self.buf);
                    self.open_invocation(fragment.trim_end_matches('\r'));
                    if let Some(mut pending) = self.current.take() {
                        pending
                            .error
                            .get_or_insert_with(|| "unterminated invocation header".to_owned());
                        self.finalize(pending);
                    }
                }
            }
        }

        (prose, self.calls)
    }

    fn open_invocation(&mut self, header: &str) {
        let mut pending = PendingCall::default();
        let mut parts = header.splitn(3, ':');
        let name = parts.next().unwrap_or_default().trim();
        let id = parts.next().map(str::trim).unwrap_or_default();
        let deps = parts.next().map(str::trim).unwrap_or_default();

        pending.name = name.to_owned();
        if name.is_empty() || name.contains(char::is_whitespace) {
            pending.error = Some(format!("malformed invocation header: '{header}'"));
        }

        if id.is_empty() {
            self.auto_counter += 1;
            pending.id = format!("gc_{}", self.auto_counter);
        } else {
            pending.id = id.to_owned();
        }

        if !deps.is_empty() {
            pending.deps = deps
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_owned)
                .collect();
        }

        self.current = Some(pending);
    }

    fn dispatch_body_line(&mut self, line: String) {
        let Some(pending) = self.current.as_mut() else {
            return;
        };

        if line.trim().starts_with(&self.config.end_prefix) {
            pending.close_arg();
            let mut done = self.current.take().unwrap_or_default();
            done.close_arg();
            self.finalize(done);
            self.mode = Mode::Prose;
            return;
        }

        if let Some(path) = line.strip_prefix(&self.config.arg_prefix) {
            pending.body_lines.push(line.clone());
            pending.close_arg();
            pending.current_path = Some(path.trim().to_owned());
            self.mode = Mode::InArg;
            return;
        }

        pending.body_lines.push(line.clone());
        match self.mode {
            Mode::InArg => pending.current_value.push(line),
            // Stray fences (or blank lines) around the body are tolerated.
            _ => {}
        }
    }

    fn finalize(&mut self, pending: PendingCall) {
        let raw_args = pending.body_lines.join("\n");
        let (args, error) = if pending.error.is_some() {
            (Value::Object(Map::new()), pending.error)
        } else {
            (assemble_args(&pending.params), None)
        };

        self.calls.push(GadgetCall {
            gadget_name: pending.name,
            invocation_id: pending.id,
            dependencies: pending.deps,
            raw_args,
            args,
            parse_error: error,
            response_id: self.response_id.clone(),
        });
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of
/// `marker`.
fn longest_marker_suffix(buf: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if buf.is_char_boundary(buf.len() - len) && marker.starts_with(&buf[buf.len() - len..]) {
            return len;
        }
    }
    0
}

/// Build the parameter object from `(json-pointer path, value)` pairs.
///
/// Numeric path segments address array elements, others object keys. A later
/// value for the same path replaces the earlier one.
fn assemble_args(params: &[(String, String)]) -> Value {
    let mut root = Value::Object(Map::new());
    for (path, value) in params {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }
        insert_at_path(&mut root, &segments, Value::String(value.clone()));
    }
    root
}

fn insert_at_path(node: &mut Value, segments: &[&str], value: Value) {
    let segment = segments[0];
    let index = segment.parse::<usize>().ok();

    if segments.len() == 1 {
        match index {
            Some(i) => {
                let arr = ensure_array(node);
                while arr.len() <= i {
                    arr.push(Value::Null);
                }
                arr[i] = value;
            }
            None => {
                let obj = ensure_object(node);
                obj.insert(segment.to_owned(), value);
            }
        }
        return;
    }

    let child = match index {
        Some(i) => {
            let arr = ensure_array(node);
            while arr.len() <= i {
                arr.push(Value::Null);
            }
            &mut arr[i]
        }
        None => {
            let obj = ensure_object(node);
            obj.entry(segment.to_owned()).or_insert(Value::Null)
        }
    };
    insert_at_path(child, &segments[1..], value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut().unwrap_or_else(|| unreachable!())
}

fn ensure_array(node: &mut Value) -> &mut Vec<Value> {
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    node.as_array_mut().unwrap_or_else(|| unreachable!())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse_whole(input: &str) -> (String, Vec<GadgetCall>) {
        let mut parser = MarkerParser::new(MarkerConfig::default(), "resp_1");
        let mut prose = parser.feed(input);
        let (tail, calls) = parser.finish();
        prose.push_str(&tail);
        (prose, calls)
    }

    const CALCULATOR: &str = "!!!GADGET_START:Calculator\n!!!ARG:op\nadd\n!!!ARG:a\n2\n!!!ARG:b\n3\n!!!GADGET_END:";

    mod prose {
        use super::*;

        #[test]
        fn plain_text_passes_through() {
            let (prose, calls) = parse_whole("Just thinking out loud.");
            assert_eq!(prose, "Just thinking out loud.");
            assert!(calls.is_empty());
        }

        #[test]
        fn prose_around_block_is_preserved() {
            let input = format!("before\n{CALCULATOR}\nafter");
            let (prose, calls) = parse_whole(&input);
            assert_eq!(prose, "before\nafter");
            assert_eq!(calls.len(), 1);
        }

        #[test]
        fn partial_marker_is_held_back() {
            let mut parser = MarkerParser::new(MarkerConfig::default(), "r");
            let emitted = parser.feed("hello !!!GADG");
            // The tail could still become a marker, so it is not emitted yet.
            assert_eq!(emitted, "hello ");
        }

        #[test]
        fn partial_marker_that_never_completes_is_prose() {
            let mut parser = MarkerParser::new(MarkerConfig::default(), "r");
            let mut prose = parser.feed("hello !!!GADG");
            prose.push_str(&parser.feed("ET_NOPE done"));
            let (tail, calls) = parser.finish();
            prose.push_str(&tail);
            assert_eq!(prose, "hello !!!GADGET_NOPE done");
            assert!(calls.is_empty());
        }
    }

    mod extraction {
        use super::*;

        #[test]
        fn single_invocation_with_args() {
            let (_, calls) = parse_whole(CALCULATOR);
            assert_eq!(calls.len(), 1);
            let call = &calls[0];
            assert_eq!(call.gadget_name, "Calculator");
            assert_eq!(call.invocation_id, "gc_1");
            assert!(call.dependencies.is_empty());
            assert!(call.parse_error.is_none());
            assert_eq!(call.args, json!({"op": "add", "a": "2", "b": "3"}));
            assert_eq!(call.response_id, "resp_1");
        }

        #[test]
        fn explicit_id_and_dependencies() {
            let input = "!!!GADGET_START:merge:mg:fa,fb\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].invocation_id, "mg");
            assert_eq!(calls[0].dependencies, vec!["fa", "fb"]);
        }

        #[test]
        fn auto_ids_count_up() {
            let input = "!!!GADGET_START:a\n!!!GADGET_END:\n!!!GADGET_START:b\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].invocation_id, "gc_1");
            assert_eq!(calls[1].invocation_id, "gc_2");
        }

        #[test]
        fn multiline_arg_values_join_with_newlines() {
            let input = "!!!GADGET_START:writer\n!!!ARG:text\nline one\nline two\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].args, json!({"text": "line one\nline two"}));
        }

        #[test]
        fn later_value_replaces_earlier() {
            let input =
                "!!!GADGET_START:g\n!!!ARG:x\nfirst\n!!!ARG:x\nsecond\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].args, json!({"x": "second"}));
        }

        #[test]
        fn numeric_segments_build_arrays() {
            let input = "!!!GADGET_START:g\n!!!ARG:items/0\nalpha\n!!!ARG:items/2\ngamma\n!!!ARG:meta/kind\nlist\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(
                calls[0].args,
                json!({"items": ["alpha", null, "gamma"], "meta": {"kind": "list"}})
            );
        }

        #[test]
        fn fenced_value_is_unwrapped() {
            let input =
                "!!!GADGET_START:g\n!!!ARG:code\n```python\nprint(1)\n```\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].args, json!({"code": "print(1)"}));
        }

        #[test]
        fn raw_args_keeps_the_verbatim_body() {
            let (_, calls) = parse_whole(CALCULATOR);
            assert_eq!(calls[0].raw_args, "!!!ARG:op\nadd\n!!!ARG:a\n2\n!!!ARG:b\n3");
        }
    }

    mod failure_modes {
        use super::*;

        #[test]
        fn malformed_header_sets_parse_error() {
            let input = "!!!GADGET_START:bad name here\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            assert!(calls[0].parse_error.is_some());
            assert_eq!(calls[0].args, json!({}));
        }

        #[test]
        fn unterminated_block_sets_parse_error() {
            let input = "!!!GADGET_START:g\n!!!ARG:x\nvalue";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls.len(), 1);
            assert!(calls[0].parse_error.as_deref().unwrap().contains("unterminated"));
        }

        #[test]
        fn header_cut_by_eof_sets_parse_error() {
            let input = "!!!GADGET_START:gadget_without_newline";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls.len(), 1);
            assert!(calls[0].parse_error.is_some());
        }

        #[test]
        fn parse_error_means_empty_args() {
            let input = "!!!GADGET_START:g\n!!!ARG:x\nvalue";
            let (_, calls) = parse_whole(input);
            assert_eq!(calls[0].args, json!({}));
        }
    }

    mod chunking {
        use super::*;

        fn parse_split(input: &str, cut: usize) -> (String, Vec<GadgetCall>) {
            let mut parser = MarkerParser::new(MarkerConfig::default(), "resp_1");
            let mut prose = String::new();
            let mut boundary = cut;
            while !input.is_char_boundary(boundary) {
                boundary += 1;
            }
            prose.push_str(&parser.feed(&input[..boundary]));
            prose.push_str(&parser.feed(&input[boundary..]));
            let (tail, calls) = parser.finish();
            prose.push_str(&tail);
            (prose, calls)
        }

        #[test]
        fn every_cut_point_is_equivalent_to_whole() {
            let input =
                format!("Some prose first.\n{CALCULATOR}\nAnd a closing remark.");
            let whole = parse_whole(&input);
            for cut in 0..=input.len() {
                assert_eq!(parse_split(&input, cut), whole, "cut at {cut}");
            }
        }

        #[test]
        fn byte_at_a_time_feeding() {
            let whole = parse_whole(CALCULATOR);
            let mut parser = MarkerParser::new(MarkerConfig::default(), "resp_1");
            let mut prose = String::new();
            for ch in CALCULATOR.chars() {
                prose.push_str(&parser.feed(&ch.to_string()));
            }
            let (tail, calls) = parser.finish();
            prose.push_str(&tail);
            assert_eq!((prose, calls), whole);
        }
    }

    mod config {
        use super::*;

        #[test]
        fn custom_prefixes() {
            let config = MarkerConfig {
                start_prefix: "<<CALL:".to_owned(),
                end_prefix: "<<END:".to_owned(),
                arg_prefix: "<<ARG:".to_owned(),
            };
            let mut parser = MarkerParser::new(config, "r");
            let prose = parser.feed("<<CALL:echo\n<<ARG:msg\nhi\n<<END:");
            let (tail, calls) = parser.finish();
            assert_eq!(prose, "");
            assert_eq!(tail, "");
            assert_eq!(calls[0].gadget_name, "echo");
            assert_eq!(calls[0].args, json!({"msg": "hi"}));
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn render_roundtrips_through_the_parser() {
            let (_, calls) = parse_whole(CALCULATOR);
            let rendered = calls[0].render(&MarkerConfig::default());
            let (_, reparsed) = parse_whole(&rendered);
            assert_eq!(reparsed[0].gadget_name, "Calculator");
            assert_eq!(reparsed[0].args, calls[0].args);
        }

        #[test]
        fn render_includes_dependencies() {
            let input = "!!!GADGET_START:merge:mg:fa,fb\n!!!GADGET_END:";
            let (_, calls) = parse_whole(input);
            let rendered = calls[0].render(&MarkerConfig::default());
            assert!(rendered.starts_with("!!!GADGET_START:merge:mg:fa,fb\n"));
        }
    }
}
