//! Index configuration and the string-keyed parameter table.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::metric::DistanceKind;

/// Configuration for building, growing, and searching an index.
///
/// Every field is also reachable by the key names of the `[Index]`
/// configuration section through [`IndexParams::set`] / [`IndexParams::get`]
/// and the ini helpers, so a saved configuration round-trips losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(clippy::struct_field_names)]
pub struct IndexParams {
    /// Distance method; cosine implies normalization on build and add.
    pub dist_calc_method: DistanceKind,
    /// Thread count for the parallel build, add, and refine sweeps.
    pub number_of_threads: usize,
    /// How many independent trees the forest holds.
    pub bkt_number: usize,
    /// Branching factor of the balanced k-means splits.
    pub bkt_kmeans_k: usize,
    /// Ranges at or below this size become leaves.
    pub bkt_leaf_size: usize,
    /// Sample cap for each k-means training batch.
    pub samples: usize,
    /// Graph row width, including the reserved back-link slot.
    pub neighborhood_size: usize,
    /// Multiplier on the initial candidate pool during graph construction.
    pub graph_neighborhood_scale: usize,
    /// Candidate pool size when recomputing a row.
    pub cef: usize,
    /// Candidate pool size when linking a freshly added vector.
    pub add_cef: usize,
    /// Distance-computation budget for refine-time searches.
    pub max_check_for_refine_graph: usize,
    /// Distance-computation budget per query.
    pub max_check: usize,
    /// Tree pivots seeded before the graph walk starts.
    pub initial_dynamic_pivots: usize,
    /// Extra tree pivots pulled each time the graph walk stalls.
    pub other_dynamic_pivots: usize,
    /// Consecutive non-improving pops tolerated before giving up.
    pub continuous_limit: usize,
    /// Inserts since the last forest build that trigger a background rebuild.
    pub add_count_for_rebuild: usize,
    /// Snapshot file name for the vector data.
    pub data_points_filename: String,
    /// Snapshot file name for the tree forest.
    pub bkt_filename: String,
    /// Snapshot file name for the neighborhood graph.
    pub graph_filename: String,
    /// Snapshot file name for the deletion set.
    pub delete_data_points_filename: String,
    /// Snapshot file name for external metadata, if any.
    pub metadata_file: String,
    /// Snapshot file name for the external metadata offsets, if any.
    pub metadata_index_file: String,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            dist_calc_method: DistanceKind::Cosine,
            number_of_threads: 1,
            bkt_number: 1,
            bkt_kmeans_k: 32,
            bkt_leaf_size: 8,
            samples: 1000,
            neighborhood_size: 32,
            graph_neighborhood_scale: 2,
            cef: 1000,
            add_cef: 500,
            max_check_for_refine_graph: 8192,
            max_check: 8192,
            initial_dynamic_pivots: 50,
            other_dynamic_pivots: 4,
            continuous_limit: 128,
            add_count_for_rebuild: 1000,
            data_points_filename: "vectors".to_string(),
            bkt_filename: "tree".to_string(),
            graph_filename: "graph".to_string(),
            delete_data_points_filename: "deletions".to_string(),
            metadata_file: "meta".to_string(),
            metadata_index_file: "meta_index".to_string(),
        }
    }
}

/// One row of the parameter table: how a field reads and writes as text.
struct ParamDescriptor {
    /// The key name, matched case-insensitively.
    key: &'static str,
    /// Renders the current value.
    get: fn(&IndexParams) -> String,
    /// Parses and stores a new value.
    set: fn(&mut IndexParams, &str) -> Result<()>,
}

/// Parses a trimmed value, mapping any failure to [`Error::FailedParseValue`].
fn parse<V: FromStr>(raw: &str) -> Result<V> {
    raw.trim().parse().map_err(|_| Error::FailedParseValue)
}

/// The single table every string-keyed access goes through.
const PARAMETERS: &[ParamDescriptor] = &[
    ParamDescriptor {
        key: "DistCalcMethod",
        get: |p| p.dist_calc_method.to_string(),
        set: |p, v| {
            p.dist_calc_method = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "NumberOfThreads",
        get: |p| p.number_of_threads.to_string(),
        set: |p, v| {
            p.number_of_threads = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "BKTNumber",
        get: |p| p.bkt_number.to_string(),
        set: |p, v| {
            p.bkt_number = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "BKTKmeansK",
        get: |p| p.bkt_kmeans_k.to_string(),
        set: |p, v| {
            p.bkt_kmeans_k = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "BKTLeafSize",
        get: |p| p.bkt_leaf_size.to_string(),
        set: |p, v| {
            p.bkt_leaf_size = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "Samples",
        get: |p| p.samples.to_string(),
        set: |p, v| {
            p.samples = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "NeighborhoodSize",
        get: |p| p.neighborhood_size.to_string(),
        set: |p, v| {
            p.neighborhood_size = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "GraphNeighborhoodScale",
        get: |p| p.graph_neighborhood_scale.to_string(),
        set: |p, v| {
            p.graph_neighborhood_scale = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "CEF",
        get: |p| p.cef.to_string(),
        set: |p, v| {
            p.cef = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "AddCEF",
        get: |p| p.add_cef.to_string(),
        set: |p, v| {
            p.add_cef = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "MaxCheckForRefineGraph",
        get: |p| p.max_check_for_refine_graph.to_string(),
        set: |p, v| {
            p.max_check_for_refine_graph = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "MaxCheck",
        get: |p| p.max_check.to_string(),
        set: |p, v| {
            p.max_check = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "NumberOfInitialDynamicPivots",
        get: |p| p.initial_dynamic_pivots.to_string(),
        set: |p, v| {
            p.initial_dynamic_pivots = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "NumberOfOtherDynamicPivots",
        get: |p| p.other_dynamic_pivots.to_string(),
        set: |p, v| {
            p.other_dynamic_pivots = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "ContinuousLimit",
        get: |p| p.continuous_limit.to_string(),
        set: |p, v| {
            p.continuous_limit = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "AddCountForRebuild",
        get: |p| p.add_count_for_rebuild.to_string(),
        set: |p, v| {
            p.add_count_for_rebuild = parse(v)?;
            Ok(())
        },
    },
    ParamDescriptor {
        key: "DataPointsFilename",
        get: |p| p.data_points_filename.clone(),
        set: |p, v| {
            p.data_points_filename = v.trim().to_string();
            Ok(())
        },
    },
    ParamDescriptor {
        key: "BKTFilename",
        get: |p| p.bkt_filename.clone(),
        set: |p, v| {
            p.bkt_filename = v.trim().to_string();
            Ok(())
        },
    },
    ParamDescriptor {
        key: "GraphFilename",
        get: |p| p.graph_filename.clone(),
        set: |p, v| {
            p.graph_filename = v.trim().to_string();
            Ok(())
        },
    },
    ParamDescriptor {
        key: "DeleteDataPointsFilename",
        get: |p| p.delete_data_points_filename.clone(),
        set: |p, v| {
            p.delete_data_points_filename = v.trim().to_string();
            Ok(())
        },
    },
    ParamDescriptor {
        key: "MetadataFile",
        get: |p| p.metadata_file.clone(),
        set: |p, v| {
            p.metadata_file = v.trim().to_string();
            Ok(())
        },
    },
    ParamDescriptor {
        key: "MetadataIndexFile",
        get: |p| p.metadata_index_file.clone(),
        set: |p, v| {
            p.metadata_index_file = v.trim().to_string();
            Ok(())
        },
    },
];

impl IndexParams {
    /// Sets a parameter by key name. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] when the key is known but the value does
    /// not parse; the old value is kept.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        for descriptor in PARAMETERS {
            if descriptor.key.eq_ignore_ascii_case(key) {
                return (descriptor.set)(self, value);
            }
        }
        Ok(())
    }

    /// Renders a parameter by key name; unknown keys yield an empty string.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        for descriptor in PARAMETERS {
            if descriptor.key.eq_ignore_ascii_case(key) {
                return (descriptor.get)(self);
            }
        }
        String::new()
    }

    /// Applies the `[Index]` section of ini-formatted text over `self`.
    ///
    /// Lines outside the `[Index]` section, comments (`;` or `#`), and
    /// unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] when a recognized key has an unparsable
    /// value.
    pub fn parse_ini(&mut self, text: &str) -> Result<()> {
        let mut in_index = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_index = section.trim().eq_ignore_ascii_case("Index");
                continue;
            }
            if !in_index {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.set(key.trim(), value)?;
            }
        }
        Ok(())
    }

    /// Renders all parameters as an `[Index]` section.
    #[must_use]
    pub fn to_ini(&self) -> String {
        let mut out = String::from("[Index]\n");
        for descriptor in PARAMETERS {
            out.push_str(descriptor.key);
            out.push('=');
            out.push_str(&(descriptor.get)(self));
            out.push('\n');
        }
        out
    }

    /// The larger of the two search budgets; workspaces are sized for it.
    pub(crate) fn workspace_max_check(&self) -> usize {
        self.max_check.max(self.max_check_for_refine_graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() -> Result<()> {
        let mut params = IndexParams::default();
        params.set("MaxCheck", "2048")?;
        params.set("distcalcmethod", "L2")?;
        assert_eq!(params.max_check, 2048);
        assert_eq!(params.dist_calc_method, DistanceKind::L2);
        assert_eq!(params.get("MaxCheck"), "2048");
        assert_eq!(params.get("DistCalcMethod"), "L2");
        Ok(())
    }

    #[test]
    fn unknown_keys_are_ignored() -> Result<()> {
        let mut params = IndexParams::default();
        params.set("NoSuchOption", "17")?;
        assert_eq!(params.get("NoSuchOption"), "");
        assert_eq!(params, IndexParams::default());
        Ok(())
    }

    #[test]
    fn bad_value_for_known_key_is_an_error() {
        let mut params = IndexParams::default();
        assert_eq!(
            params.set("MaxCheck", "not-a-number"),
            Err(Error::FailedParseValue)
        );
        assert_eq!(params.max_check, IndexParams::default().max_check);
    }

    #[test]
    fn ini_round_trip() -> Result<()> {
        let mut params = IndexParams::default();
        params.set("BKTNumber", "3")?;
        params.set("GraphFilename", "edges.bin")?;

        let mut back = IndexParams::default();
        back.parse_ini(&params.to_ini())?;
        assert_eq!(params, back);
        Ok(())
    }

    #[test]
    fn ini_only_reads_the_index_section() -> Result<()> {
        let text = "\
[Other]
MaxCheck=1
; comment
[Index]
MaxCheck=77
[Tail]
MaxCheck=2
";
        let mut params = IndexParams::default();
        params.parse_ini(text)?;
        assert_eq!(params.max_check, 77);
        Ok(())
    }
}
