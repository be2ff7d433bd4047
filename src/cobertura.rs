//! Cobertura XML writer.
//!
//! Output structure:
//!   <coverage line-rate=".." branch-rate=".." timestamp="..">
//!     <sources><source>/abs/root</source></sources>
//!     <packages>
//!       <package name="src.util">          (directory, `/` → `.`)
//!         <classes>
//!           <class name="a_c" filename="src/util/a.c">
//!             <methods><method name="foo" signature="(int)">..</method></methods>
//!             <lines><line number="3" hits="2" branch="true"
//!                          condition-coverage="50% (1/2)">..</line></lines>
//!           </class>
//!         </classes>
//!       </package>
//!     </packages>
//!   </coverage>

use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::config::Config;
use crate::model::{FileCoverage, FunctionCoverage, LineCoverage};
use crate::stats::{CoverageStat, SummarizedStats};
use crate::store::CoverageStore;
use crate::summary::{branch_stat, line_stat};

const DOCTYPE: &str = "coverage SYSTEM 'http://cobertura.sourceforge.net/xml/coverage-04.dtd'";

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Ratio in `0.0..=1.0`; nothing to cover counts as fully covered.
fn rate(stat: &CoverageStat) -> String {
    let ratio = stat.ratio_or(1.0);
    if ratio.fract() == 0.0 {
        format!("{ratio:.1}")
    } else {
        ratio.to_string()
    }
}

/// `src/util/a.c` → `a_c`. Not unique: `a.c` and `a_c` share a class name.
fn class_name(filename: &str) -> String {
    let base = filename.rsplit_once('/').map_or(filename, |(_, base)| base);
    base.replace('.', "_")
}

fn start(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
    w.write_event(Event::Start(elem))?;
    Ok(())
}

fn end(w: &mut XmlWriter, name: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_line(w: &mut XmlWriter, line: &LineCoverage) -> Result<()> {
    let number = line.lineno.to_string();
    let hits = line.count.to_string();
    let branch = branch_stat(line);
    let Some(pct) = branch.percent() else {
        let elem = BytesStart::new("line").with_attributes([
            ("number", number.as_str()),
            ("hits", hits.as_str()),
            ("branch", "false"),
        ]);
        w.write_event(Event::Empty(elem))?;
        return Ok(());
    };

    // Cobertura expects whole percentages here.
    let pct = format!("{}%", pct.trunc());
    let condition_coverage = format!("{pct} ({}/{})", branch.covered, branch.total);
    start(
        w,
        "line",
        &[
            ("number", number.as_str()),
            ("hits", hits.as_str()),
            ("branch", "true"),
            ("condition-coverage", condition_coverage.as_str()),
        ],
    )?;
    start(w, "conditions", &[])?;
    let condition = BytesStart::new("condition").with_attributes([
        ("number", "0"),
        ("type", "jump"),
        ("coverage", pct.as_str()),
    ]);
    w.write_event(Event::Empty(condition))?;
    end(w, "conditions")?;
    end(w, "line")
}

fn write_method(w: &mut XmlWriter, file: &FileCoverage, function: &FunctionCoverage) -> Result<()> {
    let full = function.name();
    let (name, signature) = match full.find('(') {
        Some(idx) => full.split_at(idx),
        None => (full, "()"),
    };
    let lines: Vec<&LineCoverage> = file
        .lines
        .values()
        .filter(|l| l.is_reportable() && function.is_function(l.function_name.as_deref()))
        .collect();
    let mut stats = SummarizedStats::default();
    for line in &lines {
        stats.line += line_stat(line);
        stats.branch += branch_stat(line);
    }

    start(
        w,
        "method",
        &[
            ("name", name),
            ("signature", signature),
            ("line-rate", rate(&stats.line).as_str()),
            ("branch-rate", rate(&stats.branch).as_str()),
            ("complexity", "0.0"),
        ],
    )?;
    start(w, "lines", &[])?;
    for line in lines {
        write_line(w, line)?;
    }
    end(w, "lines")?;
    end(w, "method")
}

fn write_class(w: &mut XmlWriter, file: &FileCoverage, class_name: &str, filename: &str) -> Result<()> {
    let stats = SummarizedStats::from_file(file);
    start(
        w,
        "class",
        &[
            ("name", class_name),
            ("filename", filename),
            ("line-rate", rate(&stats.line).as_str()),
            ("branch-rate", rate(&stats.branch).as_str()),
            ("complexity", "0.0"),
        ],
    )?;
    start(w, "methods", &[])?;
    for function in file.functions_by_line() {
        write_method(w, file, function)?;
    }
    end(w, "methods")?;
    start(w, "lines", &[])?;
    for line in file.lines.values().filter(|l| l.is_reportable()) {
        write_line(w, line)?;
    }
    end(w, "lines")?;
    end(w, "class")
}

struct Package<'a> {
    /// presented filename → file
    classes: BTreeMap<String, &'a FileCoverage>,
    stats: SummarizedStats,
}

/// Render the store as Cobertura XML, stamped with the current time.
pub fn write_cobertura(store: &CoverageStore, config: &Config) -> Result<String> {
    write_cobertura_at(store, config, Utc::now())
}

pub fn write_cobertura_at(
    store: &CoverageStore,
    config: &Config,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let mut packages: BTreeMap<String, Package> = BTreeMap::new();
    for file in store.files() {
        let filename = config.presentable_filename(&file.filename);
        let directory = filename.rsplit_once('/').map_or("", |(dir, _)| dir);
        let package = packages.entry(directory.to_string()).or_insert_with(|| Package {
            classes: BTreeMap::new(),
            stats: SummarizedStats::default(),
        });
        package.stats += SummarizedStats::from_file(file);
        package.classes.insert(filename, file);
    }

    let stats = store.summary();
    let mut w = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.write_event(Event::DocType(BytesText::from_escaped(DOCTYPE)))?;
    start(
        &mut w,
        "coverage",
        &[
            ("line-rate", rate(&stats.line).as_str()),
            ("branch-rate", rate(&stats.branch).as_str()),
            ("lines-covered", stats.line.covered.to_string().as_str()),
            ("lines-valid", stats.line.total.to_string().as_str()),
            ("branches-covered", stats.branch.covered.to_string().as_str()),
            ("branches-valid", stats.branch.total.to_string().as_str()),
            ("complexity", "0.0"),
            ("timestamp", timestamp.timestamp().to_string().as_str()),
            ("version", concat!("covmerge ", env!("CARGO_PKG_VERSION"))),
        ],
    )?;

    start(&mut w, "sources", &[])?;
    start(&mut w, "source", &[])?;
    w.write_event(Event::Text(BytesText::new(&config.root_dir())))?;
    end(&mut w, "source")?;
    end(&mut w, "sources")?;

    start(&mut w, "packages", &[])?;
    for (name, package) in &packages {
        start(
            &mut w,
            "package",
            &[
                ("name", name.replace('/', ".").as_str()),
                ("line-rate", rate(&package.stats.line).as_str()),
                ("branch-rate", rate(&package.stats.branch).as_str()),
                ("complexity", "0.0"),
            ],
        )?;
        start(&mut w, "classes", &[])?;
        for (filename, file) in &package.classes {
            write_class(&mut w, file, &class_name(filename), filename)?;
        }
        end(&mut w, "classes")?;
        end(&mut w, "package")?;
    }
    end(&mut w, "packages")?;
    end(&mut w, "coverage")?;

    String::from_utf8(w.into_inner().into_inner()).context("Cobertura output is not UTF-8")
}
