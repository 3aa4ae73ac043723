//! Part names and paths
//!
//! A part is named `partition_min_max_level`, with `_version` appended once a
//! mutation rewrote it. Names sort like the parts they describe.

use std::fmt;
use std::str::FromStr;

use super::error::PartError;

/// Partition id of unpartitioned tables
pub const DEFAULT_PARTITION: &str = "all";

/// Identity of a part, parsed from or rendered to its name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    /// Mutation version the part was rewritten at
    pub mutation: Option<u64>,
}

impl PartInfo {
    /// A freshly inserted part covering one block
    pub fn new_insert(partition_id: impl Into<String>, block: u64) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block: block,
            max_block: block,
            level: 0,
            mutation: None,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Version of the data in this part; mutations at or below it are applied
    pub fn data_version(&self) -> u64 {
        self.mutation.unwrap_or(self.min_block)
    }

    /// Whether this part's block range covers `other`'s
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && other.max_block <= self.max_block
    }

    /// Result of merging `parts`, which must share a partition
    ///
    /// Spans the combined block range one level above the highest source and
    /// keeps the mutation suffix when every source has the same one.
    pub fn merged(parts: &[PartInfo]) -> Option<PartInfo> {
        let first = parts.first()?;
        let mutation = if parts.iter().all(|p| p.mutation == first.mutation) {
            first.mutation
        } else {
            parts.iter().filter_map(|p| p.mutation).max()
        };
        Some(PartInfo {
            partition_id: first.partition_id.clone(),
            min_block: parts.iter().map(|p| p.min_block).min()?,
            max_block: parts.iter().map(|p| p.max_block).max()?,
            level: parts.iter().map(|p| p.level).max()? + 1,
            mutation,
        })
    }

    /// Same block range and level rewritten at `version`
    pub fn mutated(&self, version: u64) -> PartInfo {
        PartInfo {
            mutation: Some(version),
            ..self.clone()
        }
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if let Some(version) = self.mutation {
            write!(f, "_{}", version)?;
        }
        Ok(())
    }
}

impl FromStr for PartInfo {
    type Err = PartError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || PartError::InvalidName(name.to_string());
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(invalid());
        }
        if fields[0].is_empty() {
            return Err(invalid());
        }
        let number = |s: &str| s.parse::<u64>().map_err(|_| invalid());

        let info = PartInfo {
            partition_id: fields[0].to_string(),
            min_block: number(fields[1])?,
            max_block: number(fields[2])?,
            level: fields[3].parse().map_err(|_| invalid())?,
            mutation: fields.get(4).map(|s| number(s)).transpose()?,
        };
        if info.min_block > info.max_block {
            return Err(invalid());
        }
        Ok(info)
    }
}

/// Directory of a part: `<root>/data/<database>/<table>/<part_name>/`
pub fn part_path(data_root: &str, database: &str, table: &str, part_name: &str) -> String {
    format!(
        "{}/data/{}/{}/{}/",
        data_root.trim_end_matches('/'),
        database,
        table,
        part_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let info: PartInfo = "all_1_3_1".parse().unwrap();
        assert_eq!(info.min_block, 1);
        assert_eq!(info.max_block, 3);
        assert_eq!(info.level, 1);
        assert_eq!(info.mutation, None);
        assert_eq!(info.name(), "all_1_3_1");

        let mutated: PartInfo = "all_0_0_0_1".parse().unwrap();
        assert_eq!(mutated.mutation, Some(1));
        assert_eq!(mutated.data_version(), 1);
        assert_eq!(mutated.name(), "all_0_0_0_1");
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "all", "all_1_1", "all_a_1_0", "all_3_1_0", "_1_1_0", "all_1_1_0_2_3"] {
            assert!(name.parse::<PartInfo>().is_err(), "{}", name);
        }
    }

    #[test]
    fn test_merged_name() {
        let parts: Vec<PartInfo> = ["all_1_1_0", "all_2_2_0", "all_3_3_0"]
            .iter()
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(PartInfo::merged(&parts).unwrap().name(), "all_1_3_1");

        let parts: Vec<PartInfo> = ["all_1_2_1_4", "all_3_3_0_4"]
            .iter()
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(PartInfo::merged(&parts).unwrap().name(), "all_1_3_2_4");
        assert!(PartInfo::merged(&[]).is_none());
    }

    #[test]
    fn test_mutated_and_ordering() {
        let info = PartInfo::new_insert(DEFAULT_PARTITION, 1);
        assert_eq!(info.data_version(), 1);
        assert_eq!(info.mutated(2).name(), "all_1_1_0_2");

        let mut names: Vec<PartInfo> = ["all_2_2_0", "all_1_1_0", "all_1_2_1"]
            .iter()
            .map(|n| n.parse().unwrap())
            .collect();
        names.sort();
        let sorted: Vec<String> = names.iter().map(|p| p.name()).collect();
        assert_eq!(sorted, vec!["all_1_1_0", "all_1_2_1", "all_2_2_0"]);
        assert!(names[1].contains(&names[0]));
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path("/var/lib/clickhouse/", "default", "t", "all_1_1_0"),
            "/var/lib/clickhouse/data/default/t/all_1_1_0/"
        );
    }
}
