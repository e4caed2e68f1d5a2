//! Text analyzers registered on every opened index.
//!
//! Korean cues go through a morphological analyzer backed by the ko-dic
//! dictionary in decompose mode, so particles split off their nouns
//! (`비빔밥을` indexes as `비빔밥` + `을`). Everything else uses tantivy's
//! default analyzer.

use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, TextAnalyzer};
use tantivy::Index;

use super::error::IndexResult;

pub(crate) const KOREAN_ANALYZER: &str = "lang_ko";

const MAX_TOKEN_LEN: usize = 40;

pub(crate) fn register(index: &Index) -> IndexResult<()> {
    index.tokenizers().register(KOREAN_ANALYZER, korean_analyzer()?);
    Ok(())
}

#[cfg(feature = "korean")]
fn korean_analyzer() -> IndexResult<TextAnalyzer> {
    Ok(TextAnalyzer::builder(korean::KoreanTokenizer::shared()?)
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .build())
}

#[cfg(not(feature = "korean"))]
fn korean_analyzer() -> IndexResult<TextAnalyzer> {
    Ok(TextAnalyzer::builder(tantivy::tokenizer::SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .build())
}

#[cfg(feature = "korean")]
mod korean {
    use std::borrow::Cow;
    use std::sync::{Arc, OnceLock};

    use lindera::dictionary::load_dictionary;
    use lindera::mode::{Mode, Penalty};
    use lindera::segmenter::Segmenter;
    use tantivy::tokenizer::{Token, TokenStream, Tokenizer};
    use tracing::{debug, warn};

    use crate::index::error::{IndexError, IndexResult};

    static SEGMENTER: OnceLock<Arc<Segmenter>> = OnceLock::new();

    #[derive(Clone)]
    pub struct KoreanTokenizer {
        segmenter: Arc<Segmenter>,
    }

    impl KoreanTokenizer {
        /// Loading the embedded dictionary is slow, so the segmenter is built
        /// once per process.
        pub fn shared() -> IndexResult<Self> {
            if let Some(segmenter) = SEGMENTER.get() {
                return Ok(Self { segmenter: segmenter.clone() });
            }
            let dictionary = load_dictionary("embedded://ko-dic")
                .map_err(|e| IndexError::Analyzer(format!("ko-dic: {e}")))?;
            let segmenter = Arc::new(Segmenter::new(Mode::Decompose(Penalty::default()), dictionary, None));
            debug!("Korean segmenter loaded");
            Ok(Self {
                segmenter: SEGMENTER.get_or_init(|| segmenter).clone(),
            })
        }
    }

    pub struct KoreanTokenStream {
        tokens: std::vec::IntoIter<Token>,
        token: Token,
    }

    impl Tokenizer for KoreanTokenizer {
        type TokenStream<'a> = KoreanTokenStream;

        fn token_stream<'a>(&'a mut self, text: &'a str) -> KoreanTokenStream {
            let tokens: Vec<Token> = match self.segmenter.segment(Cow::Borrowed(text)) {
                Ok(segments) => segments
                    .into_iter()
                    .filter(|t| t.surface.chars().any(char::is_alphanumeric))
                    .map(|t| Token {
                        offset_from: t.byte_start,
                        offset_to: t.byte_end,
                        position: t.position,
                        text: t.surface.into_owned(),
                        position_length: t.position_length.max(1),
                    })
                    .collect(),
                Err(e) => {
                    warn!("Korean segmentation failed, text left unindexed: {}", e);
                    Vec::new()
                }
            };
            KoreanTokenStream {
                tokens: tokens.into_iter(),
                token: Token::default(),
            }
        }
    }

    impl TokenStream for KoreanTokenStream {
        fn advance(&mut self) -> bool {
            match self.tokens.next() {
                Some(token) => {
                    self.token = token;
                    true
                }
                None => false,
            }
        }

        fn token(&self) -> &Token {
            &self.token
        }

        fn token_mut(&mut self) -> &mut Token {
            &mut self.token
        }
    }

}
