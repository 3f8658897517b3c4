//! Co-occurrence reports over a scan result.
//!
//! Each image with at least one attributed identity is one transaction.

use crate::scanner::ScanResult;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const DEFAULT_MIN_SUPPORT: f64 = 0.01;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.80;
const MIN_LIFT: f64 = 1.0;

/// Association rule between two identities seen in the same images.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairRule {
    pub antecedent: String,
    pub consequent: String,
    /// Share of transactions containing both.
    pub support: f64,
    /// Share of the antecedent's transactions that also contain the consequent.
    pub confidence: f64,
    pub lift: f64,
}

fn transactions(results: &ScanResult) -> Vec<BTreeSet<&str>> {
    results
        .iter()
        .map(|image| image.identities().collect::<BTreeSet<_>>())
        .filter(|set| !set.is_empty())
        .collect()
}

type Singles<'a> = BTreeMap<&'a str, usize>;
type Pairs<'a> = BTreeMap<(&'a str, &'a str), usize>;

/// Per-identity and per-pair transaction counts. Pairs are ordered.
fn counts<'a>(transactions: &[BTreeSet<&'a str>]) -> (Singles<'a>, Pairs<'a>) {
    let mut singles = BTreeMap::new();
    let mut pairs = BTreeMap::new();
    for set in transactions {
        let items: Vec<&str> = set.iter().copied().collect();
        for (i, &a) in items.iter().enumerate() {
            *singles.entry(a).or_insert(0) += 1;
            for &b in &items[i + 1..] {
                *pairs.entry((a, b)).or_insert(0) += 1;
            }
        }
    }
    (singles, pairs)
}

/// Number of images each identity appears in.
pub fn raw_frequencies(results: &ScanResult) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for image in results.iter() {
        for key in image.identities() {
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Pairs of identities that tend to appear together.
///
/// For every co-occurring pair the direction with the higher confidence is
/// kept; ties keep the lexicographically smaller antecedent. Rules below
/// either threshold, or with lift under 1, are dropped. Sorted by
/// descending confidence, then support.
pub fn frequent_pairs(results: &ScanResult, min_support: f64, min_confidence: f64) -> Vec<PairRule> {
    let transactions = transactions(results);
    if transactions.is_empty() {
        return Vec::new();
    }
    let total = transactions.len() as f64;
    let (singles, pairs) = counts(&transactions);

    let mut rules = Vec::new();
    for ((a, b), both) in pairs {
        let support = both as f64 / total;
        if support < min_support {
            continue;
        }

        let count_a = singles[a] as f64;
        let count_b = singles[b] as f64;
        let conf_ab = both as f64 / count_a;
        let conf_ba = both as f64 / count_b;
        let (antecedent, consequent, confidence, consequent_count) = if conf_ba > conf_ab {
            (b, a, conf_ba, count_a)
        } else {
            (a, b, conf_ab, count_b)
        };

        let lift = confidence / (consequent_count / total);
        if confidence < min_confidence || lift < MIN_LIFT {
            continue;
        }
        rules.push(PairRule {
            antecedent: antecedent.to_string(),
            consequent: consequent.to_string(),
            support,
            confidence,
            lift,
        });
    }

    rules.sort_by(|x, y| {
        y.confidence
            .total_cmp(&x.confidence)
            .then(y.support.total_cmp(&x.support))
            .then_with(|| x.antecedent.cmp(&y.antecedent))
    });
    rules
}

/// Display names grouped by country, read from the identity keys.
pub fn names_by_country(results: &ScanResult) -> BTreeMap<String, BTreeSet<String>> {
    let mut countries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for image in results.iter() {
        for key in image.identities() {
            let Some((names, country)) = key.rsplit_once('&') else {
                continue;
            };
            countries
                .entry(country.to_string())
                .or_default()
                .insert(names.replace('_', " "));
        }
    }
    countries
}

/// Fill colors cycled over country clusters.
const CLUSTER_COLORS: [&str; 11] = [
    "#cc0000", "#cc9900", "#009900", "#990099", "#6600ff", "#339966", "#663300", "#99cc00",
    "#727072", "#669999", "#993333",
];

/// Who appears with whom, as an undirected graph.
///
/// Nodes are identity keys grouped by country; an edge joins two identities
/// seen in the same image and carries the number of such images. Displays
/// as Graphviz DOT with one cluster per country.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoOccurrenceGraph {
    countries: BTreeMap<String, BTreeSet<String>>,
    edges: BTreeMap<(String, String), usize>,
}

impl CoOccurrenceGraph {
    pub fn new(results: &ScanResult) -> Self {
        let transactions = transactions(results);
        let (singles, pairs) = counts(&transactions);

        let mut countries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in singles.keys() {
            let Some((_, country)) = key.rsplit_once('&') else {
                continue;
            };
            countries
                .entry(country.to_string())
                .or_default()
                .insert(key.to_string());
        }
        let edges = pairs
            .into_iter()
            .map(|((a, b), n)| ((a.to_string(), b.to_string()), n))
            .collect();
        Self { countries, edges }
    }

    /// Keep only identities named in `rules`, and edges between them.
    pub fn limit_to(mut self, rules: &[PairRule]) -> Self {
        let keep: BTreeSet<&str> = rules
            .iter()
            .flat_map(|r| [r.antecedent.as_str(), r.consequent.as_str()])
            .collect();
        for members in self.countries.values_mut() {
            members.retain(|key| keep.contains(key.as_str()));
        }
        self.countries.retain(|_, members| !members.is_empty());
        self.edges
            .retain(|(a, b), _| keep.contains(a.as_str()) && keep.contains(b.as_str()));
        self
    }

    pub fn node_count(&self) -> usize {
        self.countries.values().map(BTreeSet::len).sum()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn is_node(&self, key: &str) -> bool {
        self.countries.values().any(|members| members.contains(key))
    }
}

impl fmt::Display for CoOccurrenceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph crew {{")?;
        writeln!(f, "  node [shape=ellipse, style=filled];")?;
        for (i, (country, members)) in self.countries.iter().enumerate() {
            let color = CLUSTER_COLORS[i % CLUSTER_COLORS.len()];
            writeln!(f, "  subgraph cluster_{i} {{")?;
            writeln!(f, "    label={};", quoted(country))?;
            writeln!(f, "    node [fillcolor=\"{color}80\"];")?;
            for key in members {
                let name = key.rsplit_once('&').map_or(key.as_str(), |(names, _)| names);
                writeln!(f, "    {} [label={}];", quoted(key), quoted(&name.replace('_', " ")))?;
            }
            writeln!(f, "  }}")?;
        }
        for ((a, b), images) in &self.edges {
            // Keys without a country are not drawn.
            if !self.is_node(a) || !self.is_node(b) {
                continue;
            }
            writeln!(f, "  {} -- {} [weight={images}, label=\"{images}\"];", quoted(a), quoted(b))?;
        }
        writeln!(f, "}}")
    }
}

fn quoted(id: &str) -> String {
    format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\""))
}
