use once_cell::sync::Lazy;
use regex::Regex;

/// 内容分类
pub struct Category {
    /// 标题中使用的短标签，如 "CMD"
    pub tag: &'static str,
    pub label: &'static str,
    /// 关键词回退匹配使用的关键词
    pub keywords: &'static [&'static str],
    /// 数值越小优先级越高
    pub priority: u32,
}

pub static CATEGORIES: &[Category] = &[
    Category {
        tag: "CMD",
        label: "Commands & Utilities",
        keywords: &["command", "utility", "flag", "option", "syntax", "usage", "the `", "arguments", "switches"],
        priority: 1,
    },
    Category {
        tag: "SCRIPT",
        label: "Shell Scripting",
        keywords: &[
            "script", "bash", "shell script", "shebang", "#!/", "loop", "for loop", "while loop",
            "if statement", "case statement", "function", "shell function", "control flow", "variable",
            "shell variable",
        ],
        priority: 2,
    },
    Category {
        tag: "PROG",
        label: "Programming",
        keywords: &[
            "python", "program", "programming", "code", "class", "import", "module", "library", "api",
            "compile", "interpreter", "debug", "algorithm",
        ],
        priority: 3,
    },
    Category {
        tag: "FS",
        label: "File System",
        keywords: &[
            "file", "directory", "folder", "path", "permission", "owner", "group", "link", "symlink",
            "mount", "inode", "filesystem", "file system", "rwx", "chmod", "chown",
        ],
        priority: 4,
    },
    Category {
        tag: "NET",
        label: "Networking",
        keywords: &[
            "network", "ip address", "port", "socket", "http", "ssh", "dns", "tcp", "udp", "firewall",
            "protocol", "remote", "download", "upload", "url", "ftp",
        ],
        priority: 5,
    },
    Category {
        tag: "SYS",
        label: "System Admin",
        keywords: &[
            "process", "service", "daemon", "systemd", "cron", "user account", "package", "install",
            "boot", "kernel", "system", "admin", "root", "sudo", "scheduling", "startup", "environment",
        ],
        priority: 6,
    },
    Category {
        tag: "IO",
        label: "I/O & Redirection",
        keywords: &[
            "redirect", "pipe", "stdin", "stdout", "stderr", "input", "output", "stream", "tee", "> ",
            ">>", "piping", "redirection", "standard input", "standard output", "standard error",
        ],
        priority: 7,
    },
    Category {
        tag: "TEXT",
        label: "Text Processing",
        keywords: &[
            "regex", "regular expression", "pattern matching", "sed", "awk", "grep", "text processing",
            "filter", "sort", "string", "search", "replace", "transform",
        ],
        priority: 8,
    },
    Category {
        tag: "EXAMPLE",
        label: "Examples",
        keywords: &[
            "example", "demonstration", "practice", "exercise", "walkthrough", "step-by-step", "tutorial",
            "hands-on", "try this", "let's",
        ],
        priority: 9,
    },
    Category {
        tag: "TIP",
        label: "Tips & Notes",
        keywords: &[
            "tip", "trick", "best practice", "warning", "caution", "note", "remember", "important",
            "gotcha", "common mistake", "pro tip", "avoid",
        ],
        priority: 10,
    },
    Category {
        tag: "CONCEPT",
        label: "Concepts & Theory",
        keywords: &[
            "concept", "theory", "overview", "introduction", "understanding", "what is", "definition",
            "principle", "architecture", "design", "philosophy", "history", "how it works",
        ],
        priority: 11,
    },
    Category {
        tag: "OVERVIEW",
        label: "Overview",
        keywords: &["chapter overview", "summary", "recap", "review", "key takeaway", "conclusion", "introduction"],
        priority: 12,
    },
];

/// `## [TAG] 标题`
static TAG_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^##\s+\[([A-Za-z]+)\]\s+(.+)$").unwrap());

/// 关键词都没命中时的默认分类
const DEFAULT_TAG: &str = "CONCEPT";

/// 摘要中带分类的一节
#[derive(Debug, Clone, PartialEq)]
pub struct CategorizedSection {
    pub tag: String,
    /// 去掉标签后的标题
    pub title: String,
    /// 含标题行的完整内容
    pub content: String,
}

pub fn find_category(tag: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|c| c.tag.eq_ignore_ascii_case(tag))
}

/// 要求生成服务在每个 `## ` 标题前加分类标签的指令
pub fn category_tags_prompt() -> String {
    let tag_list = CATEGORIES
        .iter()
        .map(|c| format!("  - `[{}]` {}", c.tag, c.label))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "IMPORTANT: Prefix EVERY `## ` heading with a category tag in square brackets. \
         Choose the most appropriate tag from this list:\n{}\n\n\
         Example headings:\n  ## [CMD] The `ls` Command\n  ## [CONCEPT] Understanding File Permissions\n  \
         ## [IO] Pipes and Redirection\n  ## [OVERVIEW] Chapter Summary\n\n\
         Every section MUST have exactly one tag. Pick the best fit.",
        tag_list
    )
}

/// 按 `## ` 标题把摘要切分为带分类的小节
///
/// 标题带合法标签时直接采用，否则按关键词推断；第一个标题之前的文字归入 OVERVIEW
pub fn parse_categorized(summary: &str) -> Vec<CategorizedSection> {
    let mut chunks: Vec<String> = Vec::new();
    for line in summary.lines() {
        if line.starts_with("## ") || chunks.is_empty() {
            chunks.push(String::new());
        }
        if let Some(current) = chunks.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }

    chunks
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .map(|chunk| {
            let content = chunk.trim().to_string();
            let first_line = content.lines().next().unwrap_or("").trim();

            if !first_line.starts_with("## ") {
                return CategorizedSection {
                    tag: "OVERVIEW".to_string(),
                    title: "Introduction".to_string(),
                    content,
                };
            }

            let (tag, title) = match TAG_HEADING.captures(first_line) {
                Some(caps) => {
                    let title = caps[2].trim().to_string();
                    match find_category(&caps[1]) {
                        Some(category) => (category.tag.to_string(), title),
                        None => (categorize_by_keywords(&title, &content), title),
                    }
                }
                None => {
                    let title = first_line[3..].trim().to_string();
                    (categorize_by_keywords(&title, &content), title)
                }
            };

            CategorizedSection { tag, title, content }
        })
        .collect()
}

/// 关键词回退分类：标题权重更高，内容只看前 500 个字符
pub fn categorize_by_keywords(heading: &str, content: &str) -> String {
    let heading = heading.to_lowercase();
    let head: String = content.chars().take(500).collect();
    let search_text = format!("{} {} {}", heading, heading, head.to_lowercase());

    let mut best_tag = DEFAULT_TAG;
    let mut best_score = 0.0_f32;
    for category in CATEGORIES {
        let mut score = 0.0_f32;
        for keyword in category.keywords {
            if search_text.contains(keyword) {
                score += 1.0;
                if heading.contains(keyword) {
                    score += 2.0;
                }
            }
        }
        score += (15 - category.priority) as f32 * 0.1;
        if score > best_score {
            best_score = score;
            best_tag = category.tag;
        }
    }
    best_tag.to_string()
}

/// 摘要中出现的分类标签（按首次出现顺序，去重）
pub fn active_tags(sections: &[CategorizedSection]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for section in sections {
        if !tags.contains(&section.tag) {
            tags.push(section.tag.clone());
        }
    }
    tags
}

/// 去掉标题中的分类标签，`## [CMD] ls` -> `## ls`
pub fn strip_tag(heading: &str) -> String {
    match TAG_HEADING.captures(heading.trim()) {
        Some(caps) => format!("## {}", caps[2].trim()),
        None => heading.to_string(),
    }
}
