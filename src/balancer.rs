use reqwest::Url;
use std::sync::Mutex;

#[derive(Debug)]
pub struct UpstreamInfo {
    pub url: Url,
    pub weight: u32,
    current_weight: i64,
}

impl UpstreamInfo {
    pub fn new(url: Url, weight: u32) -> Self {
        Self {
            url,
            weight,
            current_weight: 0,
        }
    }
}

/// Smooth weighted round-robin over a fixed upstream set. Over any window of
/// `sum(weights)` selections each upstream is picked exactly `weight` times,
/// interleaved rather than in bursts.
#[derive(Debug)]
pub struct UpstreamPool {
    upstreams: Mutex<Vec<UpstreamInfo>>,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<UpstreamInfo>) -> Self {
        Self {
            upstreams: Mutex::new(upstreams),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn select(&self) -> Option<Url> {
        let mut upstreams = self.lock();
        if upstreams.is_empty() {
            return None;
        }
        if upstreams.len() == 1 {
            return Some(upstreams[0].url.clone());
        }

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;
        for i in 0..upstreams.len() {
            let weight = i64::from(upstreams[i].weight);
            total += weight;
            upstreams[i].current_weight += weight;
            match best {
                // ties keep the earlier upstream
                Some(b) if upstreams[b].current_weight >= upstreams[i].current_weight => {}
                _ => best = Some(i),
            }
        }

        let best = best?;
        upstreams[best].current_weight -= total;
        Some(upstreams[best].url.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UpstreamInfo>> {
        self.upstreams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
