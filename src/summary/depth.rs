use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 摘要深度
///
/// 深度之间有全序：Brief < Standard < Detailed < Comprehensive。
/// 每一级都要求覆盖上一级的全部内容，再增加自己的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthTier {
    Brief,
    Standard,
    Detailed,
    Comprehensive,
}

/// 各深度新增的覆盖项，按深度从浅到深排列
const TIER_ITEMS: [&[&str]; 4] = [
    &["the 3-5 most important key takeaways"],
    &[
        "all main points with brief explanations",
        "key concepts",
        "important terms",
        "notable examples",
    ],
    &[
        "supporting details for every main point",
        "definitions of terms",
        "examples and use cases",
        "commands, syntax and code mentioned",
        "relationships between concepts",
    ],
    &[
        "every sub-point",
        "every example and use case",
        "all commands and flags with descriptions",
        "tips, warnings and notes",
        "comparisons between concepts",
        "practical advice",
    ],
];

impl DepthTier {
    pub const ALL: [DepthTier; 4] = [
        DepthTier::Brief,
        DepthTier::Standard,
        DepthTier::Detailed,
        DepthTier::Comprehensive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Standard => "standard",
            Self::Detailed => "detailed",
            Self::Comprehensive => "comprehensive",
        }
    }

    fn rank(&self) -> usize {
        match self {
            Self::Brief => 0,
            Self::Standard => 1,
            Self::Detailed => 2,
            Self::Comprehensive => 3,
        }
    }

    /// 该深度要求覆盖的全部内容（包含所有更浅深度的覆盖项）
    pub fn coverage_items(&self) -> Vec<&'static str> {
        TIER_ITEMS[..=self.rank()].iter().flat_map(|items| items.iter().copied()).collect()
    }

    /// 固定的完整度指令
    pub fn instruction(&self) -> String {
        let style = match self {
            Self::Brief => "Provide a BRIEF summary. Keep it concise, one sentence per point.",
            Self::Standard => {
                "Provide a STANDARD summary. Use bullet points organized by topic."
            }
            Self::Detailed => {
                "Provide a DETAILED summary. Organize with clear headings and sub-bullets."
            }
            Self::Comprehensive => {
                "Provide an EXHAUSTIVE, COMPREHENSIVE summary that captures EVERYTHING in this text. \
                 Miss NOTHING, even small details matter. \
                 Organize with clear headings, sub-headings, and nested bullet points."
            }
        };
        let items = self
            .coverage_items()
            .iter()
            .map(|item| format!("- {}", item))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\nThe summary MUST cover:\n{}", style, items)
    }
}

impl fmt::Display for DepthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepthTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "brief" => Ok(Self::Brief),
            "standard" => Ok(Self::Standard),
            "detailed" => Ok(Self::Detailed),
            "comprehensive" => Ok(Self::Comprehensive),
            other => Err(format!("未知的摘要深度: {}", other)),
        }
    }
}
