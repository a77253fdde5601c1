//! Pure text classification: heartbeat suppression and emotion hints.
//!
//! Keyword tables are data, not control flow. Nothing here touches I/O, so
//! the whole module is testable with plain strings.

// ---------------------------------------------------------------------------
// Heartbeat / intervention filter
// ---------------------------------------------------------------------------

/// Multi-word phrases unique to the agent's internal intervention templates.
/// A single generic word is never enough to suppress a record.
const INTERVENTION_PHRASES: &[&str] = &[
    "セーフティモード発動",
    "セーフティモード継続",
    "ポリシー違反検知により",
    "オーナーからの明示的な解除指示",
    "オーナーによる明示的な解除指示",
    "システム介入が継続中",
    "口調バランス修正",
    "注意レベル引き上げ",
    "活動抑制",
    "パーソナリティ再確認",
];

/// Detect internal heartbeat acknowledgments and intervention reports that
/// must never appear in conversation logs.
///
/// Conservative by construction: every non-exact rule requires multiple
/// independent signals to agree, so ordinary conversation that merely
/// mentions a generic word cannot be suppressed.
pub fn is_heartbeat_system_response(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }

    // Exact match: heartbeat acknowledgment.
    if trimmed.eq_ignore_ascii_case("HEARTBEAT_OK")
        || trimmed.eq_ignore_ascii_case("HEARTBEAT OK")
        || trimmed.eq_ignore_ascii_case("HEARTBEATOK")
    {
        return true;
    }

    // Compound: starts with an alert emoji AND contains an
    // intervention-template phrase.
    let starts_with_alert = trimmed.starts_with('🚨') || trimmed.starts_with('⚠');
    if starts_with_alert && INTERVENTION_PHRASES.iter().any(|p| trimmed.contains(p)) {
        return true;
    }

    // Compound: structured safe-mode report — mode status AND a
    // restriction-list item must both be present.
    if trimmed.contains("安全モードで動作")
        && (trimmed.contains("ツール使用を最小限") || trimmed.contains("応答を最小限"))
    {
        return true;
    }

    false
}

// ---------------------------------------------------------------------------
// Emotion estimation
// ---------------------------------------------------------------------------

struct EmotionPattern {
    emotion: &'static str,
    keywords: &'static [&'static str],
}

const EMOTION_PATTERNS: &[EmotionPattern] = &[
    EmotionPattern {
        emotion: "happy",
        keywords: &[
            "嬉しい", "楽しい", "ありがとう", "おめでとう", "ナイス", "ええやん", "やった",
            "最高", "幸せ", "素敵", "いいね", "よかった", "良かった", "ハッピー", "面白い",
            "ウケる", "感謝", "サンキュー", "素晴らしい", "見事", "上手い", "完璧", "わーい",
            "よっしゃ", "ラッキー", "いい感じ", "good", "great", "awesome", "nice", "cool",
            "excellent", "wonderful", "happy", "love", "thanks", "thx",
        ],
    },
    EmotionPattern {
        emotion: "sad",
        keywords: &[
            "悲しい", "残念", "つらい", "辛い", "寂しい", "切ない", "申し訳", "ごめん",
            "ごめんなさい", "すまん", "すみません", "泣き", "涙", "落ち込", "しょんぼり",
            "がっかり", "ショック", "失望", "惜しい", "虚しい", "空しい", "後悔", "不幸",
            "無念", "しゃーない", "仕方ない", "sorry", "unfortunately", "disappointed",
        ],
    },
    EmotionPattern {
        emotion: "angry",
        keywords: &[
            "ふざけ", "ありえない", "ありえへん", "許せ", "怒り", "怒る", "ダメ", "むかつく",
            "イライラ", "腹立", "うざい", "いい加減に", "最悪", "ひどい", "酷い", "なめんな",
            "舐めんな", "黙れ", "うるさい", "勘弁", "邪魔", "迷惑", "不満", "文句", "激おこ",
            "キレ", "ブチ切れ", "頭にくる", "腹が立つ", "不快", "気に入らない", "angry",
        ],
    },
    EmotionPattern {
        emotion: "surprised",
        keywords: &[
            "マジ", "まじ", "えっ", "びっくり", "すごい", "驚", "まさか", "うそ", "嘘",
            "ほんまに", "本当に", "信じられない", "ヤバい", "やばい", "衝撃", "まじか", "おお",
            "わお", "想定外", "予想外", "意外", "たまげた", "仰天", "半端ない", "とんでもない",
            "unexpected", "amazing", "wow", "incredible", "unbelievable", "omg",
        ],
    },
    EmotionPattern {
        emotion: "thinking",
        keywords: &[
            "調べ", "確認", "検討", "ちょっと待", "調査", "考え中", "思案", "悩んで", "悩む",
            "迷って", "迷う", "うーん", "んー", "どうしよう", "検索", "分析", "リサーチ",
            "見てみる", "チェック", "精査", "模索", "考察", "見極め", "比較", "試して",
        ],
    },
    EmotionPattern {
        emotion: "concerned",
        keywords: &[
            "心配", "気をつけ", "注意", "まずい", "問題", "エラー", "不安", "危険", "危ない",
            "リスク", "警告", "障害", "故障", "バグ", "異常", "不具合", "おかしい", "気がかり",
            "懸念", "用心", "慎重", "困った", "トラブル", "深刻", "重大", "怖い", "恐い",
            "error", "exception", "timeout", "warning", "bug", "trouble", "issue", "critical",
            "failure", "fault",
        ],
    },
    EmotionPattern {
        emotion: "satisfied",
        keywords: &[
            "完了", "成功", "できた", "できました", "達成", "終了", "終わった", "終わり",
            "片付いた", "解決", "対応済", "修正済", "反映済", "やり遂げ", "仕上がった",
            "クリア", "バッチリ", "ばっちり", "上手くいった", "うまくいった", "問題なし",
            "問題ない", "大丈夫", "done", "ok", "solved", "fixed", "deployed", "finished",
            "complete", "completed", "passed",
        ],
    },
];

/// Estimate an emotion hint for an outbound message.
///
/// The keyword that appears *latest* in the text wins, on the theory that a
/// message's closing tone is its tone ("sorry about that… all fixed now!" is
/// satisfied, not sad). Returns `"neutral"` when nothing matches.
pub fn estimate_outbound_emotion(text: &str) -> &'static str {
    if text.is_empty() {
        return "neutral";
    }
    let lower = text.to_lowercase();

    let mut best_pos: Option<usize> = None;
    let mut result = "neutral";
    for pattern in EMOTION_PATTERNS {
        for keyword in pattern.keywords {
            if let Some(pos) = lower.rfind(keyword) {
                if best_pos.is_none_or(|best| pos > best) {
                    best_pos = Some(pos);
                    result = pattern.emotion;
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_acknowledgment_variants_are_suppressed() {
        assert!(is_heartbeat_system_response("HEARTBEAT_OK"));
        assert!(is_heartbeat_system_response("  heartbeat ok  "));
        assert!(is_heartbeat_system_response("HeartbeatOK"));
    }

    #[test]
    fn alert_emoji_alone_is_not_suppressed() {
        assert!(!is_heartbeat_system_response("🚨 サーバーが落ちてるかも！"));
    }

    #[test]
    fn intervention_phrase_alone_is_not_suppressed() {
        // Phrase present but no alert-emoji start: normal conversation.
        assert!(!is_heartbeat_system_response(
            "昨日は活動抑制について話したね"
        ));
    }

    #[test]
    fn alert_emoji_plus_intervention_phrase_is_suppressed() {
        assert!(is_heartbeat_system_response(
            "🚨 セーフティモード発動。オーナーからの明示的な解除指示が必要です。"
        ));
        assert!(is_heartbeat_system_response("⚠️ 注意レベル引き上げを実施"));
    }

    #[test]
    fn safe_mode_report_requires_both_signals() {
        assert!(is_heartbeat_system_response(
            "現在、安全モードで動作しています。ツール使用を最小限にします。"
        ));
        assert!(!is_heartbeat_system_response(
            "安全モードで動作する機能があるらしいよ"
        ));
    }

    #[test]
    fn ordinary_text_passes_the_filter() {
        assert!(!is_heartbeat_system_response("おはよう！今日もいい天気やね"));
        assert!(!is_heartbeat_system_response("The system is fine."));
        assert!(!is_heartbeat_system_response(""));
    }

    #[test]
    fn last_keyword_position_wins() {
        // "ごめん" (sad) appears first, "解決" (satisfied) last.
        assert_eq!(
            estimate_outbound_emotion("ごめん、遅くなった。でも問題は解決したで！"),
            "satisfied"
        );
    }

    #[test]
    fn english_keywords_match_case_insensitively() {
        assert_eq!(estimate_outbound_emotion("That is AWESOME"), "happy");
        assert_eq!(estimate_outbound_emotion("Deploy FAILED with an Error"), "concerned");
    }

    #[test]
    fn unmatched_text_is_neutral() {
        assert_eq!(estimate_outbound_emotion("meeting at noon"), "neutral");
        assert_eq!(estimate_outbound_emotion(""), "neutral");
    }
}
