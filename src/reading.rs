//! Divination methods and the readings they produce.
//!
//! Every reading is an independent uniform draw over a small fixed table.
//! The draw uses an ordinary seeded PRNG; nothing here is meant to be
//! cryptographically secure.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::DivinationError;

pub const HEAVENLY_STEMS: [&str; 10] = ["甲", "乙", "丙", "丁", "戊", "己", "庚", "辛", "壬", "癸"];

pub const EARTHLY_BRANCHES: [&str; 12] = [
    "子", "丑", "寅", "卯", "辰", "巳", "午", "未", "申", "酉", "戌", "亥",
];

pub const MAIN_STARS: [&str; 6] = ["紫微星", "天机星", "太阳星", "武曲星", "天同星", "廉贞星"];

pub const PALACES: [&str; 6] = ["命宫", "兄弟宫", "夫妻宫", "子女宫", "财帛宫", "疾厄宫"];

/// Plum Blossom numbers are drawn from `1..=PLUM_MAX`.
pub const PLUM_MAX: u8 = 8;

/// One of the four supported divination methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// 梅花易数: three numbers cast into a hexagram.
    #[serde(rename = "梅花易数")]
    PlumBlossom,
    /// 天干地支: one heavenly stem paired with one earthly branch.
    #[serde(rename = "天干地支")]
    StemBranch,
    /// 六爻: six lines cast bottom to top.
    #[serde(rename = "六爻")]
    SixYao,
    /// 紫微斗数: one main star placed in one palace.
    #[serde(rename = "紫微斗数")]
    PurpleStar,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::PlumBlossom,
        Method::StemBranch,
        Method::SixYao,
        Method::PurpleStar,
    ];

    /// The Chinese name shown to users and embedded in prompts.
    pub fn name(self) -> &'static str {
        match self {
            Method::PlumBlossom => "梅花易数",
            Method::StemBranch => "天干地支",
            Method::SixYao => "六爻",
            Method::PurpleStar => "紫微斗数",
        }
    }

    /// ASCII alias accepted on the command line.
    pub fn slug(self) -> &'static str {
        match self {
            Method::PlumBlossom => "plum-blossom",
            Method::StemBranch => "stem-branch",
            Method::SixYao => "six-yao",
            Method::PurpleStar => "purple-star",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Method::PlumBlossom => "宋代邵雍所创，以数字起卦，简便易学。",
            Method::StemBranch => "中国古代纪年法，包含十天干十二地支。",
            Method::SixYao => "《易经》占卜法，通过六根爻线组成卦象。",
            Method::PurpleStar => "传统命理学，分析星曜分布预测命运。",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = DivinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Method::ALL
            .into_iter()
            .find(|m| m.name() == trimmed || m.slug().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| DivinationError::UnsupportedMethod(trimmed.to_string()))
    }
}

/// A single cast line of a Six Yao reading.
///
/// `value` is the traditional coin total: 6 old yin, 7 young yang,
/// 8 young yin, 9 old yang.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct YaoLine {
    pub value: u8,
}

impl YaoLine {
    pub fn is_yang(self) -> bool {
        matches!(self.value, 7 | 9)
    }

    /// Old lines (6 and 9) are about to turn into their opposite.
    pub fn is_changing(self) -> bool {
        matches!(self.value, 6 | 9)
    }

    pub fn symbol(self) -> &'static str {
        if self.is_yang() {
            "———"
        } else {
            "-- --"
        }
    }
}

/// The structured outcome of one method invocation. Immutable once drawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    PlumBlossom { numbers: [u8; 3] },
    /// `lines[0]` is the bottom line.
    SixYao { lines: [YaoLine; 6] },
    StemBranch {
        stem: &'static str,
        branch: &'static str,
    },
    PurpleStar {
        star: &'static str,
        palace: &'static str,
    },
}

impl Reading {
    pub fn method(&self) -> Method {
        match self {
            Reading::PlumBlossom { .. } => Method::PlumBlossom,
            Reading::SixYao { .. } => Method::SixYao,
            Reading::StemBranch { .. } => Method::StemBranch,
            Reading::PurpleStar { .. } => Method::PurpleStar,
        }
    }

    /// Short form shown above an interpretation.
    pub fn summary(&self) -> String {
        match self {
            Reading::PlumBlossom { numbers } => format!(
                "卦象：{}\n数字：{}, {}, {}",
                hexagram_name(*numbers),
                numbers[0],
                numbers[1],
                numbers[2]
            ),
            Reading::SixYao { lines } => format!("六爻卦象：\n{}", render_lines(lines)),
            Reading::StemBranch { stem, branch } => {
                format!("天干：{stem}\n地支：{branch}\n干支组合：{stem}{branch}")
            }
            Reading::PurpleStar { star, palace } => format!("主星：{star}\n宫位：{palace}"),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}占卜结果：", self.method().name())?;
        writeln!(f)?;
        match self {
            Reading::PlumBlossom { numbers } => {
                writeln!(f, "卦象：{}", hexagram_name(*numbers))?;
                write!(f, "数字：{}, {}, {}", numbers[0], numbers[1], numbers[2])
            }
            Reading::SixYao { lines } => {
                writeln!(f, "卦象：")?;
                f.write_str(&render_lines(lines))
            }
            Reading::StemBranch { stem, branch } => {
                writeln!(f, "天干：{stem}")?;
                writeln!(f, "地支：{branch}")?;
                write!(f, "干支组合：{stem}{branch}")
            }
            Reading::PurpleStar { star, palace } => {
                writeln!(f, "主星：{star}")?;
                write!(f, "宫位：{palace}")
            }
        }
    }
}

/// Names the hexagram for three Plum Blossom numbers. Each number is clamped
/// to 2 before lookup, so only the low corner of the table has names.
pub fn hexagram_name(numbers: [u8; 3]) -> &'static str {
    let key = numbers.map(|n| n.min(2));
    match key {
        [1, 1, 1] => "乾卦",
        [1, 1, 2] => "姤卦",
        [1, 2, 1] => "同人卦",
        [1, 2, 2] => "大有卦",
        [2, 1, 1] => "履卦",
        [2, 1, 2] => "小畜卦",
        [2, 2, 1] => "需卦",
        [2, 2, 2] => "大畜卦",
        _ => "未知卦",
    }
}

// Top line first.
fn render_lines(lines: &[YaoLine; 6]) -> String {
    lines
        .iter()
        .rev()
        .map(|line| line.symbol())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source of readings. The pipeline only needs this seam, so tests can pin
/// the reading while production draws at random.
pub trait ReadingGenerator {
    fn generate(&mut self, method: Method) -> Reading;

    /// Parse a method identifier and draw for it.
    fn generate_named(&mut self, name: &str) -> Result<Reading, DivinationError> {
        let method = name.parse::<Method>()?;
        Ok(self.generate(method))
    }
}

/// Uniform draws from a standard PRNG.
pub struct RandomReadings {
    rng: StdRng,
}

impl RandomReadings {
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick(&mut self, table: &[&'static str]) -> &'static str {
        table[self.rng.random_range(0..table.len())]
    }
}

impl ReadingGenerator for RandomReadings {
    fn generate(&mut self, method: Method) -> Reading {
        match method {
            Method::PlumBlossom => Reading::PlumBlossom {
                numbers: std::array::from_fn(|_| self.rng.random_range(1..=PLUM_MAX)),
            },
            Method::SixYao => Reading::SixYao {
                lines: std::array::from_fn(|_| YaoLine {
                    value: self.rng.random_range(6..=9),
                }),
            },
            Method::StemBranch => Reading::StemBranch {
                stem: self.pick(&HEAVENLY_STEMS),
                branch: self.pick(&EARTHLY_BRANCHES),
            },
            Method::PurpleStar => Reading::PurpleStar {
                star: self.pick(&MAIN_STARS),
                palace: self.pick(&PALACES),
            },
        }
    }
}
