use crate::core::{msec_to_time, PlayerError, Result};
use crate::player::overlay::{Overlay, OverlayContent};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// 外部字幕的一条事件（时间基单位）
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub start: f64,
    pub stop: f64,
    pub content: OverlayContent,
}

impl SubtitleCue {
    fn from_ms(start_ms: i64, end_ms: i64, content: OverlayContent) -> Self {
        Self {
            start: msec_to_time(start_ms as f64),
            stop: msec_to_time(end_ms as f64),
            content,
        }
    }

    /// 生成可放入叠加层容器的叠加层（允许被后续同类事件截断）
    pub fn to_overlay(&self) -> Overlay {
        Overlay::new(self.start, Some(self.stop), self.content.clone()).with_replace(true)
    }
}

/// 外部字幕文件解析器
pub struct ExternalSubtitleParser;

impl ExternalSubtitleParser {
    /// 查找与媒体文件同目录下的字幕文件
    /// 支持的字幕文件格式：.srt, .ass, .ssa, .vtt
    pub fn find_subtitle_files(media_path: &Path) -> Vec<PathBuf> {
        let mut subtitle_files = Vec::new();
        let (Some(parent_dir), Some(file_stem)) = (media_path.parent(), media_path.file_stem()) else {
            return subtitle_files;
        };
        let file_stem = file_stem.to_string_lossy();

        let subtitle_extensions = ["srt", "ass", "ssa", "vtt"];

        // 精确匹配 - name.srt, name.ass 等
        for ext in &subtitle_extensions {
            let subtitle_path = parent_dir.join(format!("{}.{}", file_stem, ext));
            if subtitle_path.exists() {
                info!("找到精确匹配字幕文件: {}", subtitle_path.display());
                subtitle_files.push(subtitle_path);
            }
        }

        // 语言标识匹配 - name.zh.srt, name.en.srt
        let language_codes = ["zh", "en", "chs", "cht", "zh-cn", "zh-tw", "ja", "ko"];
        for lang in &language_codes {
            for ext in &subtitle_extensions {
                let subtitle_path = parent_dir.join(format!("{}.{}.{}", file_stem, lang, ext));
                if subtitle_path.exists() {
                    info!("找到语言标识字幕文件: {}", subtitle_path.display());
                    subtitle_files.push(subtitle_path);
                }
            }
        }

        subtitle_files
    }

    /// 解析外部字幕文件
    pub fn parse_subtitle_file(file_path: &Path) -> Result<Vec<SubtitleCue>> {
        let content = fs::read_to_string(file_path)?;

        let extension = file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "srt" => Ok(Self::parse_srt(&content)),
            "ass" | "ssa" => Ok(Self::parse_ass(&content)),
            "vtt" => Ok(Self::parse_vtt(&content)),
            _ => Err(PlayerError::StreamError(format!("不支持的字幕文件格式: {}", extension))),
        }
    }

    /// 解析 SRT / VTT 这类"时间行 + 文本块"格式
    fn parse_blocks<F>(content: &str, format: &str, parse_time_line: F) -> Vec<SubtitleCue>
    where
        F: Fn(&str) -> Option<(i64, i64)>,
    {
        let mut cues = Vec::new();
        let mut current: Option<(i64, i64, String)> = None;

        let mut finish = |current: &mut Option<(i64, i64, String)>| {
            if let Some((start, end, text)) = current.take() {
                if !text.trim().is_empty() {
                    cues.push(SubtitleCue::from_ms(start, end, OverlayContent::Text(text.trim().to_string())));
                }
            }
        };

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() {
                finish(&mut current);
                continue;
            }

            if line.contains("-->") {
                finish(&mut current);
                match parse_time_line(line) {
                    Some((start, end)) => current = Some((start, end, String::new())),
                    None => warn!("无法解析 {} 时间行 (第{}行): {}", format, index + 1, line),
                }
                continue;
            }

            // 文本行（时间行之前的序号 / 指令行自然被忽略）
            if let Some((_, _, ref mut text)) = current {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(line);
            }
        }
        finish(&mut current);

        cues
    }

    /// 解析 SRT 格式字幕
    fn parse_srt(content: &str) -> Vec<SubtitleCue> {
        let cues = Self::parse_blocks(content, "SRT", |line| {
            Self::parse_time_line(line, Self::parse_srt_timestamp)
        });
        info!("解析 SRT 字幕完成，共 {} 条字幕", cues.len());
        cues
    }

    /// 解析时间行：00:01:30,500 --> 00:01:33,400
    fn parse_time_line(line: &str, parse: fn(&str) -> Option<i64>) -> Option<(i64, i64)> {
        let (start, end) = line.split_once("-->")?;
        // VTT 时间行后面可能跟排版设置
        let end = end.split_whitespace().next()?;
        Some((parse(start.trim())?, parse(end)?))
    }

    /// 解析 SRT 时间戳：00:01:30,500 -> 90500ms
    fn parse_srt_timestamp(timestamp: &str) -> Option<i64> {
        let (time_part, ms_part) = timestamp.split_once(',')?;
        let ms: i64 = ms_part.parse().ok()?;
        Self::parse_clock(time_part, 3).map(|base| base + ms)
    }

    /// H:MM:SS 或 MM:SS → 毫秒
    fn parse_clock(clock: &str, max_components: usize) -> Option<i64> {
        let components: Vec<i64> = clock
            .split(':')
            .map(|c| c.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        if components.len() < 2 || components.len() > max_components {
            return None;
        }
        Some(components.iter().fold(0, |acc, c| acc * 60 + c) * 1000)
    }

    /// 解析 ASS/SSA 格式字幕（Events 段中的 Dialogue 行）
    fn parse_ass(content: &str) -> Vec<SubtitleCue> {
        let mut cues = Vec::new();
        let mut in_events_section = false;

        for line in content.lines() {
            let line = line.trim();

            if line.starts_with('[') && line.ends_with(']') {
                in_events_section = line.eq_ignore_ascii_case("[Events]");
                continue;
            }

            if in_events_section && line.starts_with("Dialogue:") {
                if let Some(cue) = Self::parse_ass_dialogue_line(line) {
                    cues.push(cue);
                }
            }
        }

        // 容器按起始时间判断嵌套
        cues.sort_by(|a, b| a.start.total_cmp(&b.start));
        info!("解析 ASS 字幕完成，共 {} 条字幕", cues.len());
        cues
    }

    /// 解析 ASS Dialogue 行
    fn parse_ass_dialogue_line(line: &str) -> Option<SubtitleCue> {
        // Dialogue: Layer,Start,End,Style,Name,MarginL,MarginR,MarginV,Effect,Text
        let parts: Vec<&str> = line.splitn(10, ',').collect();
        if parts.len() < 10 {
            return None;
        }

        let start_time = Self::parse_ass_timestamp(parts[1].trim())?;
        let end_time = Self::parse_ass_timestamp(parts[2].trim())?;
        let cleaned_text = Self::clean_ass_text(parts[9].trim());

        if cleaned_text.trim().is_empty() {
            return None;
        }
        Some(SubtitleCue::from_ms(start_time, end_time, OverlayContent::Ssa(cleaned_text)))
    }

    /// 解析 ASS 时间戳：0:01:30.50 -> 90500ms
    fn parse_ass_timestamp(timestamp: &str) -> Option<i64> {
        let (time_part, centi_part) = timestamp.split_once('.')?;
        let centiseconds: i64 = centi_part.parse().ok()?;
        Self::parse_clock(time_part, 3).map(|base| base + centiseconds * 10)
    }

    /// 清理 ASS 文本标签
    fn clean_ass_text(text: &str) -> String {
        let mut result = String::new();
        let mut in_tag = false;
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => in_tag = true,
                '}' => in_tag = false,
                _ if in_tag => {}
                '\\' => match chars.peek() {
                    Some('N') | Some('n') => {
                        chars.next();
                        result.push('\n');
                    }
                    Some('h') => {
                        chars.next();
                        result.push(' ');
                    }
                    _ => result.push(ch),
                },
                _ => result.push(ch),
            }
        }

        result.trim().to_string()
    }

    /// 解析 WebVTT 格式字幕
    fn parse_vtt(content: &str) -> Vec<SubtitleCue> {
        if !content.trim_start().starts_with("WEBVTT") {
            warn!("VTT 文件缺少 WEBVTT 头部");
        }
        let cues = Self::parse_blocks(content, "VTT", |line| {
            Self::parse_time_line(line, Self::parse_vtt_timestamp)
        });
        info!("解析 VTT 字幕完成，共 {} 条字幕", cues.len());
        cues
    }

    /// 解析 VTT 时间戳：00:01:30.500 或 01:30.500 -> 90500ms
    fn parse_vtt_timestamp(timestamp: &str) -> Option<i64> {
        let (time_part, ms_part) = timestamp.split_once('.')?;
        let ms: i64 = ms_part.parse().ok()?;
        Self::parse_clock(time_part, 3).map(|base| base + ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::overlay::OverlayKind;

    #[test]
    fn test_parse_srt_timestamp() {
        assert_eq!(ExternalSubtitleParser::parse_srt_timestamp("00:01:30,500"), Some(90500));
        assert_eq!(ExternalSubtitleParser::parse_srt_timestamp("01:23:45,123"), Some(5025123));
        assert_eq!(ExternalSubtitleParser::parse_srt_timestamp("01:23:45.123"), None);
    }

    #[test]
    fn test_parse_ass_timestamp() {
        assert_eq!(ExternalSubtitleParser::parse_ass_timestamp("0:01:30.50"), Some(90500));
        assert_eq!(ExternalSubtitleParser::parse_ass_timestamp("1:23:45.12"), Some(5025120));
    }

    #[test]
    fn test_parse_vtt_timestamp() {
        assert_eq!(ExternalSubtitleParser::parse_vtt_timestamp("01:30.500"), Some(90500));
        assert_eq!(ExternalSubtitleParser::parse_vtt_timestamp("00:01:30.500"), Some(90500));
    }

    #[test]
    fn test_clean_ass_text() {
        assert_eq!(ExternalSubtitleParser::clean_ass_text("{\\b1}Hello{\\b0} World"), "Hello World");
        assert_eq!(ExternalSubtitleParser::clean_ass_text("Line 1\\NLine 2"), "Line 1\nLine 2");
    }

    #[test]
    fn test_srt_cues_become_text_overlays() {
        let srt = "1\n00:00:01,000 --> 00:00:02,500\n你好\n世界\n\n2\n00:00:03,000 --> 00:00:04,000\nbye\n";
        let cues = ExternalSubtitleParser::parse_srt(srt);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start, 1_000_000.0);
        assert_eq!(cues[0].stop, 2_500_000.0);
        assert_eq!(cues[0].content, OverlayContent::Text("你好\n世界".to_string()));

        let overlay = cues[1].to_overlay();
        assert_eq!(overlay.kind(), OverlayKind::Text);
        assert!(overlay.replace);
        assert!(overlay.is_active_at(3_500_000.0));
    }

    #[test]
    fn test_vtt_settings_after_time_line_ignored() {
        let vtt = "WEBVTT\n\n00:01.000 --> 00:02.000 align:start\nhello\n";
        let cues = ExternalSubtitleParser::parse_vtt(vtt);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].stop, 2_000_000.0);
    }

    #[test]
    fn test_ass_dialogue_becomes_ssa_overlay() {
        let ass = "[Script Info]\nTitle: x\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\nDialogue: 0,0:00:05.00,0:00:07.00,Default,,0,0,0,,{\\i1}后{\\i0}\nDialogue: 0,0:00:01.00,0:00:09.00,Default,,0,0,0,,先\n";
        let cues = ExternalSubtitleParser::parse_ass(ass);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].content, OverlayContent::Ssa("先".to_string()));
        assert_eq!(cues[1].start, 5_000_000.0);
        assert_eq!(cues[1].content, OverlayContent::Ssa("后".to_string()));
    }

    #[test]
    fn test_find_subtitle_files_next_to_media() {
        let dir = std::env::temp_dir().join(format!("dvdcore-subs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("movie.srt"), "").unwrap();
        fs::write(dir.join("movie.zh.ass"), "").unwrap();
        fs::write(dir.join("other.srt"), "").unwrap();

        let found = ExternalSubtitleParser::find_subtitle_files(&dir.join("movie.mkv"));
        let names: Vec<String> = found
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["movie.srt".to_string(), "movie.zh.ass".to_string()]);

        let _ = fs::remove_dir_all(&dir);
    }
}
