/// Smallest accepted `max_chunk_size`; keeps every hard split making progress.
pub const MIN_CHUNK_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
}

/// Rounds a byte position down to a char boundary.
fn floor_char_boundary(text: &str, byte_pos: usize) -> usize {
    if byte_pos >= text.len() {
        return text.len();
    }
    let mut pos = byte_pos;
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '。' | '？' | '！')
}

/// Byte spans of the sentences in `text`, whitespace trimmed, empty ones dropped.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let end = if c == '\n' {
            Some(pos)
        } else if is_cjk_terminator(c) {
            Some(pos + c.len_utf8())
        } else if matches!(c, '.' | '?' | '!') {
            match chars.peek() {
                None => Some(pos + 1),
                Some((_, next)) if next.is_whitespace() => Some(pos + 1),
                _ => None,
            }
        } else {
            None
        };

        if let Some(end) = end {
            push_trimmed(text, start, end, &mut spans);
            start = if c == '\n' { pos + 1 } else { end };
        }
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let segment = &text[start..end];
    let trimmed_start = segment.len() - segment.trim_start().len();
    let trimmed = segment.trim();
    if !trimmed.is_empty() {
        let s = start + trimmed_start;
        spans.push((s, s + trimmed.len()));
    }
}

/// Splits one oversized sentence at the last space before the limit, or at a
/// char boundary when it has no spaces.
fn split_long_span(text: &str, start: usize, end: usize, max: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut pos = start;

    while end - pos > max {
        let limit = floor_char_boundary(text, pos + max);
        let cut = match text[pos..limit].rfind(' ') {
            Some(space) if space > 0 => pos + space,
            _ => limit,
        };
        push_trimmed(text, pos, cut, &mut pieces);
        pos = cut;
        while pos < end && text[pos..].starts_with(' ') {
            pos += 1;
        }
    }
    push_trimmed(text, pos, end, &mut pieces);
    pieces
}

/// Packs whole sentences into chunks of at most `max_chunk_size` bytes. Only a
/// sentence that alone exceeds the limit is split.
pub fn chunk_text(text: &str, max_chunk_size: usize) -> Vec<TextChunk> {
    let max = max_chunk_size.max(MIN_CHUNK_SIZE);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if text.len() <= max {
        return vec![TextChunk {
            text: text.to_string(),
            chunk_index: 0,
        }];
    }

    let mut units = Vec::new();
    for (start, end) in sentence_spans(text) {
        if end - start > max {
            units.extend(split_long_span(text, start, end, max));
        } else {
            units.push((start, end));
        }
    }

    let mut chunks = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in units {
        current = match current {
            Some((chunk_start, _)) if end - chunk_start <= max => Some((chunk_start, end)),
            Some((chunk_start, chunk_end)) => {
                chunks.push(TextChunk {
                    text: text[chunk_start..chunk_end].to_string(),
                    chunk_index: chunks.len(),
                });
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((chunk_start, chunk_end)) = current {
        chunks.push(TextChunk {
            text: text[chunk_start..chunk_end].to_string(),
            chunk_index: chunks.len(),
        });
    }

    chunks
}
