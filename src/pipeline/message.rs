//! 抽出済みメッセージと重複判定用シグネチャ

use derive_more::Display;

/// シグネチャで時刻が無い場合のプレースホルダ
const NO_TIME: &str = "no-time";

/// シグネチャでリプライ宛先が無い場合のプレースホルダ
const NO_REPLY_TARGET: &str = "no-reply-target";

/// ID由来シグネチャの接頭辞
const ID_PREFIX: &str = "id::";

/// チャット行から取り出したメッセージ
///
/// 抽出のたびに新しく作られ、変更されず比較にだけ使われる。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedMessage {
    /// 投稿者表示名
    pub username: String,
    /// 時刻表示（無ければ空）
    pub time_text: String,
    /// 時刻要素が存在したか
    pub has_time: bool,
    /// 本文（リプライ情報を除去した表示テキスト）
    pub raw_text: String,
    /// 読み上げ用本文（宛先への先頭メンションを除去済み）
    pub text: String,
    /// リプライか
    pub is_reply: bool,
    /// リプライ宛先ユーザー名（無ければ空）
    pub reply_target_username: String,
    /// ホストページが付与する安定ID（無ければ空）
    pub stable_id: String,
}

impl ExtractedMessage {
    /// 安定IDを持つか
    pub fn has_stable_id(&self) -> bool {
        !self.stable_id.is_empty()
    }

    /// 描画が揃ったとみなせるか（投稿者・本文があり、時刻要素があるなら時刻も入っている）
    pub fn is_ready(&self) -> bool {
        !self.username.is_empty()
            && !self.raw_text.is_empty()
            && (!self.has_time || !self.time_text.is_empty())
    }

    /// 重複判定用シグネチャ
    pub fn signature(&self) -> MessageSignature {
        if self.has_stable_id() {
            return MessageSignature(format!("{}{}", ID_PREFIX, self.stable_id));
        }
        MessageSignature(format!(
            "{}::{}::{}::{}",
            self.username,
            non_empty_or(&self.time_text, NO_TIME),
            non_empty_or(&self.reply_target_username, NO_REPLY_TARGET),
            self.raw_text
        ))
    }

    /// 安定判定用キー（描画途中なら`None`）
    pub fn stability_key(&self) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        Some(format!(
            "{}::{}::{}::{}::{}",
            self.username,
            non_empty_or(&self.time_text, NO_TIME),
            if self.is_reply { "reply" } else { "normal" },
            non_empty_or(&self.reply_target_username, NO_REPLY_TARGET),
            self.raw_text
        ))
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// 重複判定キー
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct MessageSignature(String);

impl MessageSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 安定ID由来か（IDは一意なので保持期間中は二度と読まない）
    pub fn is_id_based(&self) -> bool {
        self.0.starts_with(ID_PREFIX)
    }
}
