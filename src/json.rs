//! JSON interchange encoding of the merged model.
//!
//! The document layout follows the gcovr tracefile format so that existing
//! tracefiles can be merged. Re-reading a written document reproduces the
//! same statistics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{JsonError, MergeError};
use crate::model::{
    BranchCoverage, CallCoverage, ConditionCoverage, DecisionCoverage, FileCoverage,
    FunctionCoverage, LineCoverage,
};
use crate::store::CoverageStore;

pub const FORMAT_VERSION: &str = "0.14";

#[derive(Debug, Serialize, Deserialize)]
struct JsonDocument {
    #[serde(rename = "gcovr/format_version")]
    format_version: Value,
    files: Vec<JsonFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonFile {
    file: String,
    lines: Vec<JsonLine>,
    functions: Vec<JsonFunction>,
    #[serde(
        rename = "gcovr/data_sources",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    data_sources: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonLine {
    line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_ids: Option<Vec<u32>>,
    count: u64,
    #[serde(default)]
    branches: Vec<JsonBranch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<JsonCondition>,
    #[serde(
        rename = "gcovr/decision",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    decision: Option<JsonDecision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    calls: Vec<JsonCall>,
    #[serde(rename = "gcovr/md5", default, skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
    #[serde(rename = "gcovr/excluded", default, skip_serializing_if = "is_false")]
    excluded: bool,
    #[serde(rename = "gcovr/noncode", default, skip_serializing_if = "is_false")]
    noncode: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branchno: Option<u32>,
    count: u64,
    #[serde(default)]
    fallthrough: bool,
    #[serde(default)]
    throw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_block_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination_block_id: Option<u32>,
    #[serde(rename = "gcovr/excluded", default, skip_serializing_if = "is_false")]
    excluded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonCondition {
    conditionno: u32,
    count: u32,
    covered: u32,
    not_covered_false: Vec<u32>,
    not_covered_true: Vec<u32>,
    #[serde(rename = "gcovr/excluded", default, skip_serializing_if = "is_false")]
    excluded: bool,
}

/// Counts are signed on the wire; reconstruction upstream may have produced
/// negative values.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonDecision {
    Uncheckable,
    Conditional { count_true: i64, count_false: i64 },
    Switch { count: i64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonCall {
    callno: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_block_id: Option<u32>,
    returned: u64,
    #[serde(rename = "gcovr/excluded", default, skip_serializing_if = "is_false")]
    excluded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    demangled_name: Option<String>,
    lineno: u32,
    execution_count: u64,
    blocks_percent: f64,
    /// `("line:col", "line:col")` of start and end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pos: Option<(String, String)>,
    #[serde(rename = "gcovr/excluded", default, skip_serializing_if = "is_false")]
    excluded: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// -- encoding -----------------------------------------------------------------

fn encode_line(line: &LineCoverage) -> JsonLine {
    JsonLine {
        line_number: line.lineno,
        function_name: line.function_name.clone(),
        block_ids: line.block_ids.as_ref().map(|ids| ids.iter().copied().collect()),
        count: line.count,
        branches: line
            .branches
            .values()
            .map(|b| JsonBranch {
                branchno: b.branchno,
                count: b.count,
                fallthrough: b.fallthrough,
                throw: b.throw,
                source_block_id: b.source_block_id,
                destination_block_id: b.destination_block_id,
                excluded: b.excluded,
            })
            .collect(),
        conditions: line
            .conditions
            .values()
            .map(|c| JsonCondition {
                conditionno: c.conditionno,
                count: c.count,
                covered: c.covered,
                not_covered_false: c.not_covered_false.iter().copied().collect(),
                not_covered_true: c.not_covered_true.iter().copied().collect(),
                excluded: c.excluded,
            })
            .collect(),
        decision: line.decision.map(|d| match d {
            DecisionCoverage::Uncheckable => JsonDecision::Uncheckable,
            DecisionCoverage::Conditional {
                count_true,
                count_false,
            } => JsonDecision::Conditional {
                count_true: saturating_i64(count_true),
                count_false: saturating_i64(count_false),
            },
            DecisionCoverage::Switch { count } => JsonDecision::Switch {
                count: saturating_i64(count),
            },
        }),
        calls: line
            .calls
            .values()
            .map(|c| JsonCall {
                callno: c.callno,
                source_block_id: c.source_block_id,
                returned: c.returned,
                excluded: c.excluded,
            })
            .collect(),
        md5: line.md5.clone(),
        excluded: line.excluded,
        noncode: line.noncode,
    }
}

/// One entry per definition line.
fn encode_function(function: &FunctionCoverage) -> Vec<JsonFunction> {
    function
        .count
        .iter()
        .map(|(&lineno, &count)| {
            let pos = match (&function.start, &function.end) {
                (Some(start), Some(end)) => match (start.get(&lineno), end.get(&lineno)) {
                    (Some(s), Some(e)) => Some((format!("{}:{}", s.0, s.1), format!("{}:{}", e.0, e.1))),
                    _ => None,
                },
                _ => None,
            };
            JsonFunction {
                name: function.mangled_name.clone(),
                demangled_name: function.demangled_name.clone(),
                lineno,
                execution_count: count,
                blocks_percent: function.blocks_percent.get(&lineno).copied().unwrap_or(0.0),
                pos,
                excluded: function.excluded.get(&lineno).copied().unwrap_or(false),
            }
        })
        .collect()
}

fn encode_file(file: &FileCoverage, config: &Config) -> JsonFile {
    JsonFile {
        file: config.presentable_filename(&file.filename),
        lines: file.lines.values().map(encode_line).collect(),
        functions: file
            .functions_by_line()
            .into_iter()
            .flat_map(encode_function)
            .collect(),
        data_sources: config
            .verbose
            .then(|| file.data_sources.iter().cloned().collect()),
    }
}

/// Serialize the whole store.
pub fn to_json_string(store: &CoverageStore, config: &Config) -> Result<String, JsonError> {
    let doc = JsonDocument {
        format_version: Value::String(FORMAT_VERSION.to_string()),
        files: store.files().map(|f| encode_file(f, config)).collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

// -- decoding -----------------------------------------------------------------

fn parse_position(text: &str) -> Option<(u32, u32)> {
    let (line, col) = text.split_once(':')?;
    Some((line.trim().parse().ok()?, col.trim().parse().ok()?))
}

fn decode_line(json: JsonLine) -> Result<LineCoverage, MergeError> {
    let mut line = LineCoverage::new(json.line_number, json.function_name.as_deref(), json.count)?;
    let location = json.line_number.to_string();
    line.noncode = json.noncode;
    line.excluded = json.excluded;
    line.md5 = json.md5;
    line.block_ids = json.block_ids.map(|ids| ids.into_iter().collect());

    for b in json.branches {
        line.insert_branch(BranchCoverage {
            branchno: b.branchno,
            source_block_id: b.source_block_id,
            count: b.count,
            fallthrough: b.fallthrough,
            throw: b.throw,
            destination_block_id: b.destination_block_id,
            excluded: b.excluded,
        })?;
    }
    for c in json.conditions {
        let mut condition = ConditionCoverage::new(
            c.conditionno,
            c.count,
            c.covered,
            c.not_covered_true,
            c.not_covered_false,
        )
        .map_err(|e| e.within(&location))?;
        condition.excluded = c.excluded;
        line.insert_condition(condition)?;
    }
    if let Some(decision) = json.decision {
        let decision = match decision {
            JsonDecision::Uncheckable => DecisionCoverage::Uncheckable,
            JsonDecision::Conditional {
                count_true,
                count_false,
            } => DecisionCoverage::conditional_from_delta(count_true, count_false),
            JsonDecision::Switch { count } => DecisionCoverage::switch_from_delta(count),
        };
        line.insert_decision(decision)?;
    }
    for c in json.calls {
        line.insert_call(CallCoverage {
            callno: c.callno,
            source_block_id: c.source_block_id,
            returned: c.returned,
            excluded: c.excluded,
        })?;
    }
    Ok(line)
}

fn decode_function(json: JsonFunction) -> Result<FunctionCoverage, MergeError> {
    let mut function = FunctionCoverage::new(
        json.name.as_deref(),
        json.demangled_name.as_deref(),
        json.lineno,
        json.execution_count,
        json.blocks_percent,
    )?
    .with_excluded(json.excluded);
    if let Some((start, end)) = json.pos {
        match (parse_position(&start), parse_position(&end)) {
            (Some(start), Some(end)) => function = function.with_position(start, end),
            _ => {
                return Err(MergeError::invalid(
                    json.lineno.to_string(),
                    format!("malformed function position ({start}, {end})."),
                ))
            }
        }
    }
    Ok(function)
}

fn decode_file(json: JsonFile, source: &str, config: &Config) -> Result<FileCoverage, MergeError> {
    let options = config.merge_options();
    let mut file = FileCoverage::new(config.resolve_filename(&json.file));
    match json.data_sources {
        Some(sources) => file.data_sources.extend(sources),
        None => {
            file.data_sources.insert(source.to_string());
        }
    }
    for line in json.lines {
        let line = decode_line(line).map_err(|e| e.in_file(&file.filename))?;
        file.insert_line(line, &options)?;
    }
    for function in json.functions {
        let function = decode_function(function).map_err(|e| e.in_file(&file.filename))?;
        file.insert_function(function, &options)?;
    }
    Ok(file)
}

/// Decode a JSON document. `source` names the document in `data_sources`
/// unless the document carries its own.
pub fn from_json_slice(
    bytes: &[u8],
    source: &str,
    config: &Config,
) -> Result<Vec<FileCoverage>, JsonError> {
    let doc: JsonDocument = serde_json::from_slice(bytes)?;
    let found = match &doc.format_version {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if found != FORMAT_VERSION {
        return Err(JsonError::Version {
            found,
            expected: FORMAT_VERSION.to_string(),
        });
    }
    debug!(source, files = doc.files.len(), "decoding tracefile");
    doc.files
        .into_iter()
        .map(|f| decode_file(f, source, config).map_err(JsonError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeMode;
    use crate::stats::SummarizedStats;

    fn config() -> Config {
        Config::default().with_root("/proj")
    }

    fn sample_store() -> CoverageStore {
        let opts = config().merge_options();
        let mut file = FileCoverage::new("/proj/src/a.c");
        let mut line = LineCoverage::new(3, None, 2).unwrap();
        line.md5 = Some("d41d8cd9".to_string());
        line.insert_branch(BranchCoverage::new(0, 2)).unwrap();
        line.insert_branch(BranchCoverage::new(1, 0)).unwrap();
        line.insert_decision(DecisionCoverage::Conditional {
            count_true: 2,
            count_false: 0,
        })
        .unwrap();
        line.insert_condition(ConditionCoverage::new(0, 2, 1, [], [0]).unwrap())
            .unwrap();
        line.insert_call(CallCoverage::new(0, 1)).unwrap();
        file.insert_line(line, &opts).unwrap();
        let mut noncode = LineCoverage::new(4, None, 0).unwrap();
        noncode.noncode = true;
        file.insert_line(noncode, &opts).unwrap();
        file.insert_function(
            FunctionCoverage::new(Some("_Z3foov"), Some("foo()"), 2, 1, 66.7)
                .unwrap()
                .with_position((2, 1), (6, 2)),
            &opts,
        )
        .unwrap();

        let mut store = CoverageStore::new(opts);
        store.merge(file).unwrap();
        store
    }

    #[test]
    fn test_document_layout() {
        let text = to_json_string(&sample_store(), &config()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["gcovr/format_version"], "0.14");
        let file = &value["files"][0];
        assert_eq!(file["file"], "src/a.c");
        assert_eq!(file["lines"][0]["gcovr/decision"]["type"], "conditional");
        assert_eq!(file["lines"][0]["gcovr/md5"], "d41d8cd9");
        assert_eq!(file["lines"][1]["gcovr/noncode"], true);
        assert_eq!(file["functions"][0]["pos"][0], "2:1");
        assert_eq!(file["functions"][0]["name"], "_Z3foov");
        assert!(file.get("gcovr/data_sources").is_none());
    }

    #[test]
    fn test_round_trip_preserves_stats() {
        let store = sample_store();
        let text = to_json_string(&store, &config()).unwrap();
        let files = from_json_slice(text.as_bytes(), "trace.json", &config()).unwrap();

        let mut reread = CoverageStore::new(config().merge_options());
        reread.merge_all(files).unwrap();
        assert_eq!(SummarizedStats::from_store(&reread), store.summary());

        let file = reread.get("/proj/src/a.c").unwrap();
        assert!(file.data_sources.contains("trace.json"));
        let original = store.get("/proj/src/a.c").unwrap();
        assert_eq!(file.lines, original.lines);
        assert_eq!(file.functions, original.functions);
    }

    #[test]
    fn test_wrong_version() {
        let text = r#"{"gcovr/format_version": "0.5", "files": []}"#;
        let err = from_json_slice(text.as_bytes(), "t.json", &config()).unwrap_err();
        assert!(matches!(err, JsonError::Version { .. }), "{err}");
    }

    #[test]
    fn test_negative_decision_becomes_uncheckable() {
        let text = r#"{
            "gcovr/format_version": "0.14",
            "files": [{
                "file": "a.c",
                "lines": [{
                    "line_number": 7,
                    "count": 1,
                    "branches": [],
                    "gcovr/decision": {"type": "conditional", "count_true": -1, "count_false": 2}
                }],
                "functions": []
            }]
        }"#;
        let files = from_json_slice(text.as_bytes(), "t.json", &config()).unwrap();
        let line = files[0].lines.values().next().unwrap();
        assert_eq!(line.decision, Some(DecisionCoverage::Uncheckable));
        assert_eq!(files[0].filename, "/proj/a.c");
    }

    #[test]
    fn test_invalid_condition_names_location() {
        let text = r#"{
            "gcovr/format_version": "0.14",
            "files": [{
                "file": "a.c",
                "lines": [{
                    "line_number": 7,
                    "count": 1,
                    "conditions": [{"conditionno": 1, "count": 3, "covered": 3,
                                    "not_covered_true": [], "not_covered_false": []}]
                }],
                "functions": []
            }]
        }"#;
        let err = from_json_slice(text.as_bytes(), "t.json", &config()).unwrap_err();
        match err {
            JsonError::Merge(e) => assert_eq!(e.location(), "/proj/a.c:7 (condition 1)"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_separate_functions_fail_in_strict() {
        let separate = config().with_merge_mode(MergeMode::Separate);
        let mut file = FileCoverage::new("/proj/a.c");
        let opts = separate.merge_options();
        file.insert_function(FunctionCoverage::new(Some("f"), None, 3, 1, 0.0).unwrap(), &opts)
            .unwrap();
        file.insert_function(FunctionCoverage::new(Some("f"), None, 5, 1, 0.0).unwrap(), &opts)
            .unwrap();
        let mut store = CoverageStore::new(opts);
        store.merge(file).unwrap();

        let text = to_json_string(&store, &separate).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["files"][0]["functions"].as_array().unwrap().len(), 2);

        assert!(from_json_slice(text.as_bytes(), "t.json", &separate).is_ok());
        let err = from_json_slice(text.as_bytes(), "t.json", &config()).unwrap_err();
        assert!(err.to_string().contains("multiple lines"), "{err}");
    }

    #[test]
    fn test_verbose_writes_data_sources() {
        let verbose = Config {
            verbose: true,
            ..config()
        };
        let mut store = sample_store();
        store
            .merge(FileCoverage::new("/proj/src/a.c").with_source("run1.json"))
            .unwrap();
        let text = to_json_string(&store, &verbose).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["files"][0]["gcovr/data_sources"][0], "run1.json");
    }
}
