//! `<think>...</think>` splitting for providers that inline reasoning in text.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

/// Incremental splitter. Tags may be cut at any chunk boundary; the trailing
/// bytes that could still become a tag are carried into the next push.
#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    in_think: bool,
    carry: String,
}

impl ThinkTagSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(chunk);

        let mut out = Vec::new();
        loop {
            let tag = self.current_tag();
            if let Some(pos) = buffer.find(tag) {
                self.emit(&mut out, &buffer[..pos]);
                self.in_think = !self.in_think;
                buffer.drain(..pos + tag.len());
                continue;
            }

            let keep = partial_tag_len(&buffer, tag);
            let split = buffer.len() - keep;
            self.emit(&mut out, &buffer[..split]);
            self.carry = buffer[split..].to_string();
            break;
        }
        out
    }

    /// Release whatever is still carried; call once the stream ends.
    pub fn flush(&mut self) -> Vec<Segment> {
        let carry = std::mem::take(&mut self.carry);
        let mut out = Vec::new();
        self.emit(&mut out, &carry);
        out
    }

    fn current_tag(&self) -> &'static str {
        if self.in_think { CLOSE_TAG } else { OPEN_TAG }
    }

    fn emit(&self, out: &mut Vec<Segment>, text: &str) {
        if text.is_empty() {
            return;
        }
        match (out.last_mut(), self.in_think) {
            (Some(Segment::Thinking(prev)), true) | (Some(Segment::Text(prev)), false) => {
                prev.push_str(text)
            }
            (_, true) => out.push(Segment::Thinking(text.to_string())),
            (_, false) => out.push(Segment::Text(text.to_string())),
        }
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `tag`.
fn partial_tag_len(buffer: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| buffer.ends_with(&tag[..n]))
        .unwrap_or(0)
}

/// Split a complete string into alternating text/thinking segments.
pub fn split_think_tags(text: &str) -> Vec<Segment> {
    let mut splitter = ThinkTagSplitter::new();
    let mut segments = splitter.push(text);
    for segment in splitter.flush() {
        match (segments.last_mut(), segment) {
            (Some(Segment::Text(prev)), Segment::Text(next))
            | (Some(Segment::Thinking(prev)), Segment::Thinking(next)) => prev.push_str(&next),
            (_, segment) => segments.push(segment),
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&str]) -> Vec<Segment> {
        let mut splitter = ThinkTagSplitter::new();
        let mut out: Vec<Segment> = Vec::new();
        for chunk in chunks {
            out.extend(splitter.push(chunk));
        }
        out.extend(splitter.flush());

        // Adjacent segments of one kind belong to the same block.
        let mut merged: Vec<Segment> = Vec::new();
        for segment in out {
            match (merged.last_mut(), segment) {
                (Some(Segment::Text(prev)), Segment::Text(next))
                | (Some(Segment::Thinking(prev)), Segment::Thinking(next)) => prev.push_str(&next),
                (_, segment) => merged.push(segment),
            }
        }
        merged
    }

    #[test]
    fn split_is_chunk_boundary_invariant() {
        let expected = vec![
            Segment::Text("he".into()),
            Segment::Thinking("why".into()),
            Segment::Text(" because".into()),
        ];
        assert_eq!(feed(&["he<th", "ink>why</thi", "nk> because"]), expected);
        assert_eq!(feed(&["he<think>why</think> because"]), expected);
        assert_eq!(split_think_tags("he<think>why</think> because"), expected);

        let text = "he<think>why</think> because";
        let bytes: Vec<String> = text.chars().map(String::from).collect();
        let chunks: Vec<&str> = bytes.iter().map(String::as_str).collect();
        assert_eq!(feed(&chunks), expected);
    }

    #[test]
    fn partial_tag_is_held_until_disproven() {
        let mut splitter = ThinkTagSplitter::new();
        assert_eq!(splitter.push("a<thi"), vec![Segment::Text("a".into())]);
        assert_eq!(splitter.push("s is not a tag"), vec![Segment::Text(
            "<this is not a tag".into()
        )]);
        assert!(splitter.flush().is_empty());
    }

    #[test]
    fn unterminated_tail_is_flushed() {
        let mut splitter = ThinkTagSplitter::new();
        assert_eq!(splitter.push("x</thi"), vec![Segment::Text("x</thi".into())]);
        assert_eq!(splitter.push("<"), Vec::<Segment>::new());
        assert_eq!(splitter.flush(), vec![Segment::Text("<".into())]);
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(split_think_tags("hello"), vec![Segment::Text("hello".into())]);
        assert!(split_think_tags("").is_empty());
        assert_eq!(split_think_tags("<think>only</think>"), vec![Segment::Thinking(
            "only".into()
        )]);
    }
}
