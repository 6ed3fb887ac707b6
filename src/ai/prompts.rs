//! 发给生成服务的提示词

use crate::parser::{ExtractedImage, FigureKind};
use crate::summary::category::category_tags_prompt;
use crate::summary::depth::DepthTier;

/// 原始表格文本送入视觉描述时的上限
const TABLE_TEXT_CHARS: usize = 2000;

const ASSISTANT: &str = "You are StudySage, an expert study assistant.";

/// 摘要的系统提示
pub fn summary_system_prompt() -> String {
    format!(
        "{} Your job is to create clear, well-organized summaries of book chapters \
         that help students learn and review material efficiently.\n\n\
         Format your response in clean Markdown with:\n\
         - Clear headings (##, ###)\n\
         - Bullet points for lists\n\
         - **Bold** for key terms and commands\n\
         - `code formatting` for commands, syntax, file paths\n\
         - Numbered lists for sequential steps or processes\n\n{}",
        ASSISTANT,
        category_tags_prompt()
    )
}

/// 单段（或整章直接生成）摘要的指令
///
/// # 参数
/// - `depth`: 摘要深度
/// - `context`: 章节标题，分段时为 "章节 › 小标题"
/// - `part`: 分段时为 (序号, 总数)
/// - `instructions`: 用户附加指令
pub fn section_prompt(
    depth: DepthTier,
    context: &str,
    part: Option<(usize, usize)>,
    instructions: Option<&str>,
) -> String {
    let mut prompt = format!("{}\n\n{}\n\n", summary_system_prompt(), depth.instruction());
    prompt.push_str(&format!("Chapter: **{}**\n\n", context));
    if let Some((index, total)) = part {
        prompt.push_str(&format!(
            "This is part {} of {} of the chapter. Summarize only this part.\n\n",
            index + 1,
            total
        ));
    }
    if let Some(extra) = instructions {
        prompt.push_str(&format!("Additional instructions: {}\n\n", extra));
    }
    prompt.push_str("Text to summarize:");
    prompt
}

/// 合并分段摘要的指令
pub fn merge_prompt(depth: DepthTier, chapter_title: &str, instructions: Option<&str>) -> String {
    let mut prompt = format!(
        "{}\n\nThe following are summaries of consecutive parts of the chapter **{}**, \
         each preceded by a marker of the form <!-- section:N -->.\n\
         Combine them into one coherent summary:\n\
         - Remove content repeated across parts.\n\
         - Keep every [TAG] in the headings.\n\
         - Keep the chapter order of the parts.\n\
         - Keep every <!-- section:N --> marker on its own line in front of the content \
         that came from that part.\n\n{}\n\n",
        summary_system_prompt(),
        chapter_title,
        depth.instruction()
    );
    if let Some(extra) = instructions {
        prompt.push_str(&format!("Additional instructions: {}\n\n", extra));
    }
    prompt.push_str("Summaries to combine:");
    prompt
}

/// 图片或表格的描述指令
pub fn figure_instruction(image: &ExtractedImage, chapter_title: &str) -> String {
    match image.kind {
        FigureKind::Image => format!(
            "{} Analyze this image from a textbook and provide a clear, concise description \
             that helps a student understand what the image shows.\n\n\
             Include:\n\
             - What the image depicts (diagram, chart, screenshot, illustration, etc.)\n\
             - Key information or data shown\n\
             - How it relates to the chapter content\n\
             - Any labels, legends, or annotations\n\n\
             Keep the description to 2-4 sentences. Use Markdown formatting.\n\n\
             This image is from the chapter: **{}**\n\nDescribe this image:",
            ASSISTANT, chapter_title
        ),
        FigureKind::Table => {
            let mut prompt = format!(
                "{} Analyze this table from a textbook and provide a clear summary that helps \
                 a student understand the key information.\n\n\
                 Include:\n\
                 - What the table is about (its purpose)\n\
                 - Key data points, comparisons, or relationships shown\n\
                 - Any important patterns or takeaways\n\n\
                 Keep it concise but informative (3-5 sentences). Use Markdown formatting.\n\n\
                 This table is from the chapter: **{}**\n\n",
                ASSISTANT, chapter_title
            );
            if let Some(text) = image.text.as_deref().filter(|t| !t.trim().is_empty()) {
                let raw: String = text.chars().take(TABLE_TEXT_CHARS).collect();
                prompt.push_str(&format!("Raw table text (for reference):\n```\n{}\n```\n\n", raw));
            }
            prompt.push_str("Summarize this table:");
            prompt
        }
    }
}

/// 问答指令
pub fn question_prompt(chapter_title: &str, question: &str) -> String {
    format!(
        "{} Answer the user's question based ONLY on the provided chapter text. \
         If the answer isn't in the text, say so clearly. Use Markdown formatting for clarity.\n\
         Cite specific parts of the text when possible.\n\n\
         Chapter: **{}**\n\nQuestion: {}\n\nChapter text:",
        ASSISTANT, chapter_title, question
    )
}

/// 关键内容提取指令
pub fn extraction_prompt(mode_instruction: &str, chapter_title: &str) -> String {
    format!(
        "{} Extract and organize information precisely from the provided text. \
         Only include items actually present in the text, do not add external knowledge.\n\n\
         Chapter: **{}**\n\n{}\n\nText:",
        ASSISTANT, chapter_title, mode_instruction
    )
}

/// 把手册页整理成参考卡片的指令
pub fn man_page_prompt(command: &str) -> String {
    format!(
        "You are StudySage, an expert Linux/Unix study assistant. \
         A student is learning about commands from a textbook and wants to understand this command clearly.\n\n\
         Summarize this man page into a SIMPLE, CLEAR reference card. \
         The original man page is often overly technical, make it approachable.\n\n\
         Format your response EXACTLY like this:\n\n\
         ## `command` - One-Line Description\n\n\
         **What it does:** 1-2 sentence plain-English explanation.\n\n\
         **Basic usage:**\n```\ncommand [common usage pattern]\n```\n\n\
         **Most useful flags:**\n| Flag | What it does |\n|------|-------------|\n| `-x` | Simple explanation |\n\n\
         **Common examples:**\n```bash\n# Example with explanation\ncommand -flags args\n```\n\n\
         **Pro tip:** One helpful tip for beginners.\n\n\
         Rules:\n\
         - Keep explanations simple, as if for someone who just started learning Linux\n\
         - Only include the 8-12 most useful flags, not all of them\n\
         - Give 3-5 real-world examples\n\
         - Skip flags that are rarely used or very advanced\n\
         - Use plain English and avoid jargon\n\n\
         Summarize this man page for the `{}` command:",
        command
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: Option<String>) -> ExtractedImage {
        ExtractedImage {
            page: 3,
            paragraph: None,
            kind: FigureKind::Table,
            label: "Table 1".to_string(),
            mime_type: "image/png".to_string(),
            width: 400,
            height: 300,
            bytes: vec![1, 2, 3],
            text,
        }
    }

    #[test]
    fn test_section_prompt_mentions_part_and_instructions() {
        let prompt = section_prompt(DepthTier::Brief, "Chapter 2 › Pipes", Some((1, 4)), Some("focus on flags"));
        assert!(prompt.contains("part 2 of 4"));
        assert!(prompt.contains("focus on flags"));
        assert!(prompt.contains("BRIEF"));
    }

    #[test]
    fn test_merge_prompt_keeps_markers() {
        let prompt = merge_prompt(DepthTier::Detailed, "Chapter 9", None);
        assert!(prompt.contains("<!-- section:N -->"));
        assert!(prompt.contains("Chapter 9"));
    }

    #[test]
    fn test_man_page_prompt_names_command() {
        let prompt = man_page_prompt("tar");
        assert!(prompt.ends_with("for the `tar` command:"));
        assert!(prompt.contains("**Most useful flags:**"));
    }

    #[test]
    fn test_table_instruction_truncates_raw_text() {
        let prompt = figure_instruction(&table(Some("x".repeat(5000))), "Chapter 1");
        assert!(prompt.contains("Summarize this table:"));
        assert!(prompt.contains(&"x".repeat(TABLE_TEXT_CHARS)));
        assert!(!prompt.contains(&"x".repeat(TABLE_TEXT_CHARS + 1)));

        let prompt = figure_instruction(&table(None), "Chapter 1");
        assert!(!prompt.contains("Raw table text"));
    }
}
