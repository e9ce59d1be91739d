//! Paginated transaction-log source
//!
//! A remote analytical store hands out events in fixed-size pages. [`PagedLog`]
//! turns that into a lazy, finite iterator that can be restarted from the first
//! page, and owns the underlying connection for exactly the lifetime of one pass.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::data::TransactionEvent;

/// An open connection to a store that serves events page by page.
pub trait PageConnection {
    /// Fetch at most `limit` events starting at row `offset`.
    fn fetch_page(&mut self, offset: usize, limit: usize) -> anyhow::Result<Vec<TransactionEvent>>;

    /// Release the connection. Called exactly once per session.
    fn close(&mut self) {}
}

/// Opens fresh connections, one per pass over the log.
pub trait Connector {
    type Connection: PageConnection;

    fn connect(&self) -> anyhow::Result<Self::Connection>;
}

/// A connection scoped to one pass; closed when dropped.
struct Session<T: PageConnection> {
    conn: T,
}

impl<T: PageConnection> Drop for Session<T> {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// A restartable paginated transaction log.
#[derive(Debug, Clone)]
pub struct PagedLog<C: Connector> {
    connector: C,
    page_size: usize,
}

impl<C: Connector> PagedLog<C> {
    pub fn new(connector: C, page_size: usize) -> anyhow::Result<Self> {
        if page_size == 0 {
            anyhow::bail!("page size must be positive");
        }
        Ok(Self {
            connector,
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start a new pass from the first page. No connection is opened until the
    /// first event is requested.
    pub fn iter(&self) -> PageIter<'_, C> {
        PageIter {
            log: self,
            session: None,
            buffer: VecDeque::new(),
            offset: 0,
            pages: 0,
            finished: false,
        }
    }

    /// Drain the whole log into memory.
    pub fn collect_events(&self) -> anyhow::Result<Vec<TransactionEvent>> {
        self.iter().collect()
    }
}

/// One pass over a [`PagedLog`].
///
/// The stream ends after the first page holding fewer rows than the page size,
/// an empty page included. The connection is released as soon as the stream
/// ends, on the first error, or when the iterator is dropped.
pub struct PageIter<'a, C: Connector> {
    log: &'a PagedLog<C>,
    session: Option<Session<C::Connection>>,
    buffer: VecDeque<TransactionEvent>,
    offset: usize,
    pages: usize,
    finished: bool,
}

impl<C: Connector> PageIter<'_, C> {
    /// Pages fetched so far in this pass.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<anyhow::Result<TransactionEvent>> {
        warn!(offset = self.offset, error = %err, "transaction log fetch failed");
        self.finished = true;
        self.session = None;
        self.buffer.clear();
        Some(Err(err))
    }
}

impl<C: Connector> Iterator for PageIter<'_, C> {
    type Item = anyhow::Result<TransactionEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            if self.session.is_none() {
                match self.log.connector.connect() {
                    Ok(conn) => self.session = Some(Session { conn }),
                    Err(err) => return self.fail(err),
                }
            }
            let Some(session) = self.session.as_mut() else {
                return None;
            };

            let page_size = self.log.page_size();
            let page = match session.conn.fetch_page(self.offset, page_size) {
                Ok(page) => page,
                Err(err) => return self.fail(err),
            };
            if page.len() > page_size {
                let err = anyhow::anyhow!(
                    "page at offset {} returned {} rows, more than the page size {}",
                    self.offset,
                    page.len(),
                    page_size
                );
                return self.fail(err);
            }

            self.pages += 1;
            self.offset += page.len();
            if page.len() < page_size {
                debug!(pages = self.pages, rows = self.offset, "transaction log drained");
                self.finished = true;
                self.session = None;
            }
            self.buffer.extend(page);
        }
    }
}
