//! K-way merge of time-ordered sample streams.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use tracing::debug;
use tsq_types::{Order, Sample, SampleError, SampleIterator};

/// Merges any number of individually ordered sources into one ordered stream.
///
/// The current head of every source competes in a binary heap keyed by timestamp (in the
/// requested direction) and then by the order in which sources were added, so samples with
/// equal timestamps always come out in source registration order.
///
/// A source that fails reports its error once and is then dropped from the merge.
#[derive(Debug)]
pub struct SortedMerge<S: SampleIterator> {
    order: Order,
    sources: Vec<Option<S>>,
    heap: BinaryHeap<Reverse<Head>>,
    errors: VecDeque<SampleError>,
    started: bool,
    closed: bool,
}

#[derive(Debug)]
struct Head {
    sample: Sample,
    source: usize,
    order: Order,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .apply(self.sample.timestamp.cmp(&other.sample.timestamp))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl<S: SampleIterator> SortedMerge<S> {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            errors: VecDeque::new(),
            started: false,
            closed: false,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Register another ordered source. Sources added after iteration started join the merge
    /// from their current position.
    pub fn add_iterator(&mut self, source: S) {
        let index = self.sources.len();
        self.sources.push(Some(source));
        if self.started {
            self.advance(index);
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn sources(&self) -> impl Iterator<Item = &S> {
        self.sources.iter().flatten()
    }

    /// Pull the next sample of `index` into the heap.
    fn advance(&mut self, index: usize) {
        let Some(source) = self.sources.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        match source.next() {
            Some(Ok(sample)) => self.heap.push(Reverse(Head {
                sample,
                source: index,
                order: self.order,
            })),
            Some(Err(e)) => {
                debug!(source = index, error = %e, "dropping failed merge source");
                self.errors.push_back(e);
                self.close_source(index);
            }
            None => {}
        }
    }

    fn close_source(&mut self, index: usize) {
        if let Some(mut source) = self.sources.get_mut(index).and_then(Option::take) {
            source.close();
        }
    }
}

impl<S: SampleIterator> Iterator for SortedMerge<S> {
    type Item = Result<Sample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        if !self.started {
            self.started = true;
            for index in 0..self.sources.len() {
                self.advance(index);
            }
        }
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }

        let Reverse(head) = self.heap.pop()?;
        self.advance(head.source);
        Some(Ok(head.sample))
    }
}

impl<S: SampleIterator> SampleIterator for SortedMerge<S> {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.heap.clear();
        for index in 0..self.sources.len() {
            self.close_source(index);
        }
    }
}

impl<S: SampleIterator> Drop for SortedMerge<S> {
    fn drop(&mut self) {
        self.close();
    }
}
