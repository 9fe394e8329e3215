//! Device-side SMO iteration
//!
//! [`DeviceSolver`] owns every device buffer of one training run: labels,
//! gradient, alphas and their bound status, the kernel diagonal, the column
//! cache and the reducer buffers. The host loop drives it one iteration at
//! a time:
//!
//! 1. [`DeviceSolver::select_working_set`]: gmax pass and reduction, then
//!    (unless converged) column `i`, the objective-difference pass and the
//!    min-index reduction
//! 2. [`DeviceSolver::compute_alpha`]: column `j` and the two-variable step
//! 3. [`DeviceSolver::update_alpha_status`]
//! 4. [`DeviceSolver::update_gradient`]: gradient pass, then cache commit
//!
//! Any failed pass, transfer or allocation is returned as an error and ends
//! the run; dropping the solver releases its device memory.

use super::objective::{
    gmax_candidate, obj_diff_candidate, update_pair, Candidate, FirstIndex, PairState,
};
use super::problem::DeviceProblem;
use crate::cache::{CacheStats, ColumnCache, StageSlot, Staged};
use crate::core::{AlphaStatus, CValue, GradValue, Result, SVMError, SolverConfig};
use crate::device::{Device, DeviceBuffer, LaunchConfig};
use crate::reduce::{
    cross_block_reduce, Candidate as _, GmaxCandidate, GmaxReducer, MinCandidate, MinIdxReducer,
    PingPong,
};
use log::{debug, info, trace};

/// Outcome of working-set selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Selected { i: usize, j: usize },
    Converged,
}

impl Selection {
    /// 0 when a pair was selected, 1 when the problem is solved
    pub fn code(&self) -> i32 {
        match self {
            Selection::Selected { .. } => 0,
            Selection::Converged => 1,
        }
    }
}

/// Host vectors handed to [`DeviceSolver::setup_solver`]
#[derive(Debug, Clone, Copy)]
pub struct SolverInit<'a> {
    /// `+1`/`-1` per dual variable
    pub y: &'a [i8],
    /// Initial gradient, usually the linear term `p`
    pub gradient: &'a [GradValue],
    pub alpha: &'a [GradValue],
    pub alpha_status: &'a [AlphaStatus],
    pub cp: f64,
    pub cn: f64,
    pub active_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct WorkingPair {
    i: usize,
    j: usize,
    /// alpha change of `i` and `j` from the last `compute_alpha`
    delta: [GradValue; 2],
}

struct SolverState {
    active_size: usize,
    cp: f64,
    cn: f64,
    y: DeviceBuffer<i8>,
    g: DeviceBuffer<GradValue>,
    alpha: DeviceBuffer<GradValue>,
    status: DeviceBuffer<AlphaStatus>,
    qd: DeviceBuffer<GradValue>,
    /// one kernel row over the training rows, regression only
    kernel_row: Option<DeviceBuffer<f64>>,
    cache: ColumnCache,
    gmax_buffers: PingPong<GmaxCandidate>,
    min_buffers: PingPong<MinCandidate>,
    working: Option<WorkingPair>,
}

/// SMO solver whose iteration runs on a device
pub struct DeviceSolver {
    device: Device,
    problem: DeviceProblem,
    eps: f64,
    cache_size_mb: f64,
    state: Option<SolverState>,
}

impl DeviceSolver {
    pub fn new(device: Device, problem: DeviceProblem, config: &SolverConfig) -> Self {
        Self {
            device,
            problem,
            eps: config.epsilon,
            cache_size_mb: config.cache_size_mb,
            state: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn problem(&self) -> &DeviceProblem {
        &self.problem
    }

    /// Upload the solver vectors, build `QD` and the initial gradient, and
    /// set up the column cache
    pub fn setup_solver(&mut self, init: SolverInit<'_>) -> Result<()> {
        let n = init.active_size;
        if n != self.problem.active_size() {
            return Err(SVMError::DimensionMismatch {
                expected: self.problem.active_size(),
                actual: n,
            });
        }
        for len in [
            init.y.len(),
            init.gradient.len(),
            init.alpha.len(),
            init.alpha_status.len(),
        ] {
            if len != n {
                return Err(SVMError::DimensionMismatch {
                    expected: n,
                    actual: len,
                });
            }
        }
        if let Some(&bad) = init.y.iter().find(|&&y| y != 1 && y != -1) {
            return Err(SVMError::InvalidLabel(f64::from(bad)));
        }
        if !(init.cp > 0.0 && init.cn > 0.0) {
            return Err(SVMError::InvalidParameter(format!(
                "penalties must be positive, got Cp={} Cn={}",
                init.cp, init.cn
            )));
        }

        let device = &self.device;
        let problem = &self.problem;
        let launch = device.launch_for(n);
        info!(
            "selected work-group size {}, {} groups, problem size {}",
            launch.group_size, launch.groups, n
        );

        let y = device.upload(init.y)?;
        let mut g = device.upload(init.gradient)?;
        let alpha = device.upload(init.alpha)?;
        let status = device.upload(init.alpha_status)?;

        let mut qd = device.alloc::<GradValue>(n)?;
        device.dispatch("setup_qd", launch, &mut qd, launch.group_size, |group, out| {
            for (slot, t) in out.iter_mut().zip(group.lane_range(n)) {
                let r = problem.data_row(t);
                *slot = problem.kernel_value(r, r);
            }
        })?;

        init_gradient(device, problem, &mut g, &y, &alpha, init.alpha_status)?;

        let kernel_row = if problem.svm_type().is_regression() {
            Some(device.alloc::<f64>(problem.len())?)
        } else {
            None
        };
        let cache = ColumnCache::new(device, self.cache_size_mb, n)?;
        let gmax_buffers = PingPong::new(device, n)?;
        let min_buffers = PingPong::new(device, n)?;
        debug!("device memory in use: {} bytes", device.allocated_bytes());

        self.state = Some(SolverState {
            active_size: n,
            cp: init.cp,
            cn: init.cn,
            y,
            g,
            alpha,
            status,
            qd,
            kernel_row,
            cache,
            gmax_buffers,
            min_buffers,
            working: None,
        });
        Ok(())
    }

    /// Pick the maximal violating pair over the first `l` variables
    pub fn select_working_set(&mut self, l: usize) -> Result<Selection> {
        let device = &self.device;
        let problem = &self.problem;
        let st = state_mut(&mut self.state)?;
        check_len(st, l)?;
        let launch = device.launch_for(l);

        st.gmax_buffers.reset();
        {
            let (y, g, status) = (&st.y, &st.g, &st.status);
            let out = &mut st.gmax_buffers.primary_mut()[..l];
            device.dispatch("prep_gmax", launch, out, launch.group_size, |group, out| {
                for (slot, t) in out.iter_mut().zip(group.lane_range(l)) {
                    *slot = gmax_candidate(t, y[t], g[t], status[t]);
                }
            })?;
        }
        let best = cross_block_reduce(
            device,
            launch.group_size,
            &mut GmaxReducer::new(&mut st.gmax_buffers),
            l,
        )?;
        trace!(
            "gmax = {}, gmax2 = {}, gmax_idx = {}",
            best.gmax,
            best.gmax2,
            best.gmax_idx
        );
        st.working = None;
        if best.gap() < self.eps || !best.has_index() {
            return Ok(Selection::Converged);
        }

        let i = best.gmax_idx;
        stage_column(device, problem, st, i, StageSlot::I)?;

        st.min_buffers.reset();
        {
            let column = st
                .cache
                .staged_column(StageSlot::I, i)
                .ok_or_else(|| unstaged("obj_diff", i))?;
            let first = FirstIndex {
                gmax: best.gmax,
                y: st.y[i],
                qd: st.qd[i],
            };
            let (y, g, status, qd) = (&st.y, &st.g, &st.status, &st.qd);
            let candidate = |t: usize| {
                obj_diff_candidate(
                    &first,
                    &Candidate {
                        t,
                        y: y[t],
                        g: g[t],
                        status: status[t],
                        qd: qd[t],
                        q_it: column[t],
                    },
                )
            };
            // the two halves of a regression problem share one lane per row
            let (lanes, pass) = match mirrored_half(problem, l) {
                Some(half) => (half, device.launch_for(half)),
                None => (l, launch),
            };
            let out = &mut st.min_buffers.primary_mut()[..lanes];
            device.dispatch("obj_diff", pass, out, pass.group_size, |group, out| {
                for (slot, t) in out.iter_mut().zip(group.lane_range(lanes)) {
                    *slot = if lanes == l {
                        candidate(t)
                    } else {
                        candidate(t).merge(candidate(t + lanes))
                    };
                }
            })?;
        }
        let reduced = mirrored_half(problem, l).unwrap_or(l);
        let second = cross_block_reduce(
            device,
            device.launch_for(reduced).group_size,
            &mut MinIdxReducer::new(&mut st.min_buffers),
            reduced,
        )?;
        if !second.is_valid() {
            debug!("no second index improves the objective for i = {i}");
            return Ok(Selection::Converged);
        }

        let j = second.index;
        st.working = Some(WorkingPair {
            i,
            j,
            delta: [0.0, 0.0],
        });
        Ok(Selection::Selected { i, j })
    }

    /// Fetch column `j` and solve the two-variable subproblem
    pub fn compute_alpha(&mut self) -> Result<()> {
        let device = &self.device;
        let problem = &self.problem;
        let st = state_mut(&mut self.state)?;
        let mut pair = st.working.ok_or_else(no_pair)?;

        stage_column(device, problem, st, pair.j, StageSlot::J)?;
        let q_ij = st
            .cache
            .staged_column(StageSlot::I, pair.i)
            .map(|column| column[pair.j])
            .ok_or_else(|| unstaged("compute_alpha", pair.i))?;

        let (cp, cn) = (st.cp, st.cn);
        let (y, g, qd, alpha) = (&st.y, &st.g, &st.qd, &mut st.alpha);
        let update = device.single_writer("compute_alpha", || {
            let (i, j) = (pair.i, pair.j);
            let c = |t: usize| if y[t] > 0 { cp } else { cn };
            let update = update_pair(&PairState {
                y: [y[i], y[j]],
                g: [g[i], g[j]],
                qd: [qd[i], qd[j]],
                alpha: [alpha[i], alpha[j]],
                c: [c(i), c(j)],
                q_ij: GradValue::from(q_ij),
            });
            alpha[i] = update.alpha[0];
            alpha[j] = update.alpha[1];
            update
        })?;
        trace!(
            "alpha[{}] = {}, alpha[{}] = {}",
            pair.i,
            update.alpha[0],
            pair.j,
            update.alpha[1]
        );

        pair.delta = update.delta;
        st.working = Some(pair);
        Ok(())
    }

    /// Reclassify the bound status of the working pair
    pub fn update_alpha_status(&mut self) -> Result<()> {
        let device = &self.device;
        let st = state_mut(&mut self.state)?;
        let pair = st.working.ok_or_else(no_pair)?;
        let (cp, cn) = (st.cp, st.cn);
        let (y, alpha, status) = (&st.y, &st.alpha, &mut st.status);
        device.single_writer("update_alpha_status", || {
            for t in [pair.i, pair.j] {
                let c = if y[t] > 0 { cp } else { cn };
                status[t] = AlphaStatus::from_alpha(alpha[t], c);
            }
        })
    }

    /// Apply the pair's alpha change to the gradient and commit both columns
    pub fn update_gradient(&mut self, l: usize) -> Result<()> {
        let device = &self.device;
        let problem = &self.problem;
        let st = state_mut(&mut self.state)?;
        check_len(st, l)?;
        let pair = st.working.ok_or_else(no_pair)?;
        let launch = device.launch_for(l);

        {
            let column_i = st
                .cache
                .staged_column(StageSlot::I, pair.i)
                .ok_or_else(|| unstaged("update_gradient", pair.i))?;
            let column_j = st
                .cache
                .staged_column(StageSlot::J, pair.j)
                .ok_or_else(|| unstaged("update_gradient", pair.j))?;
            let [delta_i, delta_j] = pair.delta;
            let step = |t: usize| {
                GradValue::from(column_i[t]) * delta_i + GradValue::from(column_j[t]) * delta_j
            };
            match mirrored_half(problem, l) {
                Some(half) => {
                    let pass = device.launch_for(half);
                    let (low, high) = st.g[..l].split_at_mut(half);
                    device.dispatch_pair(
                        "update_gradient",
                        pass,
                        low,
                        high,
                        pass.group_size,
                        |group, low, high| {
                            let lanes = low.iter_mut().zip(high.iter_mut());
                            for ((g_lo, g_hi), t) in lanes.zip(group.lane_range(half)) {
                                *g_lo += step(t);
                                *g_hi += step(t + half);
                            }
                        },
                    )?;
                }
                None => {
                    let out = &mut st.g[..l];
                    device.dispatch("update_gradient", launch, out, launch.group_size, |group, out| {
                        for (g_t, t) in out.iter_mut().zip(group.lane_range(l)) {
                            *g_t += step(t);
                        }
                    })?;
                }
            }
        }

        let committed = st.cache.commit_staged(device, pair.i, pair.j)?;
        trace!("committed {committed} columns for ({}, {})", pair.i, pair.j);
        Ok(())
    }

    /// Copy gradient, alphas and status of the first `l` variables back
    pub fn fetch_vectors(
        &self,
        gradient: &mut [GradValue],
        alpha: &mut [GradValue],
        alpha_status: &mut [AlphaStatus],
        l: usize,
    ) -> Result<()> {
        let st = self.state.as_ref().ok_or_else(not_set_up)?;
        check_len(st, l)?;
        for (len, name) in [
            (gradient.len(), "fetch gradient"),
            (alpha.len(), "fetch alpha"),
            (alpha_status.len(), "fetch alpha status"),
        ] {
            if len < l {
                return Err(SVMError::Transfer {
                    operation: name.to_string(),
                    expected: l,
                    actual: len,
                });
            }
        }
        self.device.download("fetch gradient", &st.g, &mut gradient[..l])?;
        self.device.download("fetch alpha", &st.alpha, &mut alpha[..l])?;
        self.device
            .download("fetch alpha status", &st.status, &mut alpha_status[..l])?;

        let stats = st.cache.stats();
        debug!(
            "column cache: {} hits, {} misses ({:.1}% hit rate), {}/{} columns resident",
            stats.hits,
            stats.misses,
            st.cache.hit_rate() * 100.0,
            stats.size,
            stats.capacity
        );
        Ok(())
    }

    /// Labels as uploaded, for rho and model extraction
    pub fn labels(&self) -> Result<Vec<i8>> {
        let st = self.state.as_ref().ok_or_else(not_set_up)?;
        let mut y = vec![0i8; st.active_size];
        self.device.download("fetch labels", &st.y, &mut y)?;
        Ok(y)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.state.as_ref().map(|st| st.cache.stats())
    }

    pub fn cache(&self) -> Option<&ColumnCache> {
        self.state.as_ref().map(|st| &st.cache)
    }

    /// Working pair selected by the last `select_working_set`
    pub fn working_pair(&self) -> Option<(usize, usize)> {
        self.state
            .as_ref()
            .and_then(|st| st.working)
            .map(|pair| (pair.i, pair.j))
    }
}

impl std::fmt::Debug for DeviceSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSolver")
            .field("device", &self.device)
            .field("problem", &self.problem)
            .field("eps", &self.eps)
            .field("ready", &self.state.is_some())
            .finish()
    }
}

fn state_mut(state: &mut Option<SolverState>) -> Result<&mut SolverState> {
    state.as_mut().ok_or_else(not_set_up)
}

fn check_len(st: &SolverState, l: usize) -> Result<()> {
    if l == 0 || l > st.active_size {
        return Err(SVMError::InvalidParameter(format!(
            "active length {l} outside 1..={}",
            st.active_size
        )));
    }
    Ok(())
}

/// Rows per half when the `l` variables are the two mirrored halves of a
/// regression problem
fn mirrored_half(problem: &DeviceProblem, l: usize) -> Option<usize> {
    let rows = problem.len();
    (problem.svm_type().is_regression() && l == 2 * rows).then_some(rows)
}

fn not_set_up() -> SVMError {
    SVMError::InvalidParameter("setup_solver has not run".to_string())
}

fn no_pair() -> SVMError {
    SVMError::InvalidParameter("no working pair selected".to_string())
}

fn unstaged(operation: &str, column: usize) -> SVMError {
    SVMError::Dispatch {
        operation: format!("{operation} (column {column} is not staged)"),
    }
}

/// `G[t] += Σ alpha_s Q_s[t]` over the variables off their lower bound,
/// in chunks of at most `max_grid_size` lanes
fn init_gradient(
    device: &Device,
    problem: &DeviceProblem,
    g: &mut DeviceBuffer<GradValue>,
    y: &[i8],
    alpha: &[GradValue],
    status: &[AlphaStatus],
) -> Result<()> {
    let n = g.len();
    let sources: Vec<usize> = (0..n)
        .filter(|&s| status[s] != AlphaStatus::LowerBound && alpha[s] != 0.0)
        .collect();
    if sources.is_empty() {
        return Ok(());
    }

    let step = device.properties().max_grid_size.min(n).max(1);
    let group_size = device.launch_for(n).group_size;
    let mut start = 0;
    while start < n {
        let len = step.min(n - start);
        let launch = LaunchConfig::covering(len, group_size);
        let out = &mut g[start..start + len];
        device.dispatch("init_gradient", launch, out, group_size, |group, out| {
            for (g_t, local) in out.iter_mut().zip(group.lane_range(len)) {
                let t = start + local;
                let r_t = problem.data_row(t);
                for &s in &sources {
                    let q = f64::from(y[s]) * f64::from(y[t])
                        * problem.kernel_value(problem.data_row(s), r_t);
                    *g_t += alpha[s] * q;
                }
            }
        })?;
        start += len;
    }
    debug!(
        "initialised gradient from {} non-zero alphas in chunks of {}",
        sources.len(),
        step
    );
    Ok(())
}

/// Stage `column` in `slot` and fill the buffer on a miss
fn stage_column(
    device: &Device,
    problem: &DeviceProblem,
    st: &mut SolverState,
    column: usize,
    slot: StageSlot,
) -> Result<Staged> {
    let staged = st.cache.stage(device, column, slot)?;
    if !staged.hit {
        let buffer = st.cache.column_mut(staged.node);
        fill_column(device, problem, &st.y, st.kernel_row.as_mut(), buffer, column)?;
    }
    trace!(
        "column {column} in slot {:?}: {}",
        slot,
        if staged.hit { "hit" } else { "miss" }
    );
    Ok(staged)
}

/// Write `Q_i[t] = y_i y_t K(x_i, x_t)` for every dual variable `t`
///
/// For regression the kernel row is evaluated once over the training rows
/// and mirrored into both halves of the column.
fn fill_column(
    device: &Device,
    problem: &DeviceProblem,
    y: &[i8],
    kernel_row: Option<&mut DeviceBuffer<f64>>,
    column: &mut [CValue],
    i: usize,
) -> Result<()> {
    let n = column.len();
    let y_i = f64::from(y[i]);
    let r_i = problem.data_row(i);
    let launch = device.launch_for(n);

    match kernel_row {
        Some(row) => {
            let l = problem.len();
            let half = device.launch_for(l);
            device.dispatch("kernel_row", half, row, half.group_size, |group, out| {
                for (slot, r) in out.iter_mut().zip(group.lane_range(l)) {
                    *slot = problem.kernel_value(r_i, r);
                }
            })?;
            let row: &[f64] = row;
            device.dispatch("fill_column", launch, column, launch.group_size, |group, out| {
                for (slot, t) in out.iter_mut().zip(group.lane_range(n)) {
                    *slot = (y_i * f64::from(y[t]) * row[t % l]) as CValue;
                }
            })
        }
        None => device.dispatch("fill_column", launch, column, launch.group_size, |group, out| {
            for (slot, t) in out.iter_mut().zip(group.lane_range(n)) {
                *slot = (y_i * f64::from(y[t]) * problem.kernel_value(r_i, t)) as CValue;
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Sample, SparseVector, SvmType};
    use crate::device::DeviceConfig;
    use crate::kernel::KernelType;
    use crate::solver::problem::load_problem_parameters;
    use approx::assert_relative_eq;

    fn device() -> Device {
        Device::new(&DeviceConfig {
            memory_bytes: 1 << 22,
            threads: Some(2),
            ..DeviceConfig::default()
        })
        .expect("device")
    }

    fn point(x: f64, label: f64) -> Sample {
        Sample::new(SparseVector::new(vec![0], vec![x]), label)
    }

    fn solver(samples: &[Sample], config: &SolverConfig) -> DeviceSolver {
        let dev = device();
        let problem = load_problem_parameters(&dev, samples, config).expect("load");
        DeviceSolver::new(dev, problem, config)
    }

    fn iterate(solver: &mut DeviceSolver, l: usize, max_iter: usize) -> usize {
        for iter in 0..max_iter {
            match solver.select_working_set(l).expect("select") {
                Selection::Converged => return iter,
                Selection::Selected { .. } => {
                    solver.compute_alpha().expect("alpha");
                    solver.update_alpha_status().expect("status");
                    solver.update_gradient(l).expect("gradient");
                }
            }
        }
        panic!("no convergence within {max_iter} iterations");
    }

    fn fetch(solver: &DeviceSolver, l: usize) -> (Vec<f64>, Vec<f64>, Vec<AlphaStatus>) {
        let mut g = vec![0.0; l];
        let mut alpha = vec![0.0; l];
        let mut status = vec![AlphaStatus::LowerBound; l];
        solver
            .fetch_vectors(&mut g, &mut alpha, &mut status, l)
            .expect("fetch");
        (g, alpha, status)
    }

    #[test]
    fn test_two_point_problem_solves_in_one_step() {
        let samples = [point(1.0, 1.0), point(-1.0, -1.0)];
        let config = SolverConfig::default();
        let mut solver = solver(&samples, &config);
        solver
            .setup_solver(SolverInit {
                y: &[1, -1],
                gradient: &[-1.0, -1.0],
                alpha: &[0.0, 0.0],
                alpha_status: &[AlphaStatus::LowerBound; 2],
                cp: 1.0,
                cn: 1.0,
                active_size: 2,
            })
            .expect("setup");

        assert_eq!(iterate(&mut solver, 2, 10), 1);
        let (g, alpha, status) = fetch(&solver, 2);
        assert_relative_eq!(alpha[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(alpha[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(g[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(g[1], 0.0, epsilon = 1e-6);
        assert_eq!(status, vec![AlphaStatus::Free; 2]);

        let dev = solver.device();
        assert_eq!(dev.pass_count("setup_qd"), 1);
        assert_eq!(dev.pass_count("prep_gmax"), 2);
        // the converging selection stops before the objective pass
        assert_eq!(dev.pass_count("obj_diff"), 1);
        assert_eq!(dev.pass_count("compute_alpha"), 1);
    }

    #[test]
    fn test_initial_gradient_includes_nonzero_alphas() {
        let samples = [point(1.0, 1.0), point(-1.0, -1.0), point(2.0, 1.0)];
        let config = SolverConfig::default();
        let mut solver = solver(&samples, &config);
        solver
            .setup_solver(SolverInit {
                y: &[1, -1, 1],
                gradient: &[-1.0; 3],
                alpha: &[0.5, 0.5, 0.0],
                alpha_status: &[AlphaStatus::Free, AlphaStatus::Free, AlphaStatus::LowerBound],
                cp: 1.0,
                cn: 1.0,
                active_size: 3,
            })
            .expect("setup");

        let (g, _, _) = fetch(&solver, 3);
        // G[t] = -1 + 0.5 Q_0t + 0.5 Q_1t, Q_st = y_s y_t x_s x_t
        assert_relative_eq!(g[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(g[2], 1.0, epsilon = 1e-12);
        assert_eq!(solver.device().pass_count("init_gradient"), 1);
    }

    #[test]
    fn test_separable_problem_keeps_equality_constraint() {
        let samples: Vec<Sample> = (0..12)
            .map(|k| {
                let label = if k % 2 == 0 { 1.0 } else { -1.0 };
                point(label * (1.0 + k as f64 * 0.25), label)
            })
            .collect();
        let y: Vec<i8> = samples.iter().map(|s| s.label as i8).collect();
        let config = SolverConfig {
            c: 10.0,
            kernel: KernelType::Rbf { gamma: 0.5 },
            ..SolverConfig::default()
        };
        let mut solver = solver(&samples, &config);
        solver
            .setup_solver(SolverInit {
                y: &y,
                gradient: &[-1.0; 12],
                alpha: &[0.0; 12],
                alpha_status: &[AlphaStatus::LowerBound; 12],
                cp: 10.0,
                cn: 10.0,
                active_size: 12,
            })
            .expect("setup");

        let iterations = iterate(&mut solver, 12, 1_000);
        assert!(iterations > 0);
        let (_, alpha, status) = fetch(&solver, 12);
        let balance: f64 = alpha.iter().zip(&y).map(|(a, &y)| a * f64::from(y)).sum();
        assert_relative_eq!(balance, 0.0, epsilon = 1e-9);
        for (a, s) in alpha.iter().zip(&status) {
            assert!((0.0..=10.0).contains(a));
            assert_eq!(*s, AlphaStatus::from_alpha(*a, 10.0));
        }
        let stats = solver.cache_stats().expect("stats");
        assert!(stats.misses > 0);
        assert!(stats.size <= stats.capacity);
        solver.cache().expect("cache").debug_validate_invariants();
    }

    #[test]
    fn test_regression_column_is_mirrored() {
        let samples = [point(1.0, 1.0), point(2.0, 2.0)];
        let config = SolverConfig {
            svm_type: SvmType::EpsilonSvr { p: 0.1 },
            ..SolverConfig::default()
        };
        let mut solver = solver(&samples, &config);
        solver
            .setup_solver(SolverInit {
                y: &[1, 1, -1, -1],
                gradient: &[-0.9, -1.9, 1.1, 2.1],
                alpha: &[0.0; 4],
                alpha_status: &[AlphaStatus::LowerBound; 4],
                cp: 1.0,
                cn: 1.0,
                active_size: 4,
            })
            .expect("setup");

        let selection = solver.select_working_set(4).expect("select");
        assert!(matches!(selection, Selection::Selected { i: 1, .. }));
        let column = solver
            .cache()
            .and_then(|cache| cache.staged_column(StageSlot::I, 1))
            .expect("staged column");
        assert_eq!(column, [2.0f32, 4.0, -2.0, -4.0].as_slice());
        assert_eq!(solver.device().pass_count("kernel_row"), 1);
    }

    #[test]
    fn test_empty_up_set_converges_without_objective_pass() {
        let samples = [point(1.0, 1.0), point(2.0, 1.0)];
        let mut solver = solver(&samples, &SolverConfig::default());
        solver
            .setup_solver(SolverInit {
                y: &[1, 1],
                gradient: &[-1.0, -1.0],
                alpha: &[1.0, 1.0],
                alpha_status: &[AlphaStatus::UpperBound; 2],
                cp: 1.0,
                cn: 1.0,
                active_size: 2,
            })
            .expect("setup");

        // no variable can move up, so gmax stays at -inf
        assert_eq!(solver.select_working_set(2).expect("select"), Selection::Converged);
        let dev = solver.device();
        assert_eq!(dev.pass_count("prep_gmax"), 1);
        assert_eq!(dev.pass_count("obj_diff"), 0);
        assert_eq!(dev.pass_count("min_idx_reduce"), 0);
        assert!(solver.compute_alpha().is_err());
    }

    #[test]
    fn test_single_active_variable_converges() {
        let samples = [point(1.0, 1.0), point(-1.0, -1.0)];
        let mut solver = solver(&samples, &SolverConfig::default());
        solver
            .setup_solver(SolverInit {
                y: &[1, -1],
                gradient: &[-1.0, -1.0],
                alpha: &[0.0, 0.0],
                alpha_status: &[AlphaStatus::LowerBound; 2],
                cp: 1.0,
                cn: 1.0,
                active_size: 2,
            })
            .expect("setup");

        // the lone variable can only move up, so gmax2 stays at -inf
        assert_eq!(solver.select_working_set(1).expect("select"), Selection::Converged);
        assert_eq!(solver.device().pass_count("obj_diff"), 0);
        assert_eq!(solver.device().pass_count("min_idx_reduce"), 0);
        assert_eq!(solver.cache_stats().expect("stats").misses, 0);
    }

    #[test]
    fn test_regression_passes_pair_mirrored_lanes() {
        let rows = 40;
        let p = 0.05;
        let samples: Vec<Sample> = (0..rows)
            .map(|k| {
                let x = k as f64 / 10.0;
                point(x, 2.0 * x - 1.0)
            })
            .collect();
        let config = SolverConfig {
            svm_type: SvmType::EpsilonSvr { p },
            ..SolverConfig::default()
        };
        let mut y = vec![1i8; rows];
        y.extend(std::iter::repeat(-1i8).take(rows));
        let mut linear: Vec<f64> = samples.iter().map(|s| p - s.label).collect();
        linear.extend(samples.iter().map(|s| p + s.label));

        let mut solver = solver(&samples, &config);
        solver
            .setup_solver(SolverInit {
                y: &y,
                gradient: &linear,
                alpha: &vec![0.0; 2 * rows],
                alpha_status: &vec![AlphaStatus::LowerBound; 2 * rows],
                cp: 1.0,
                cn: 1.0,
                active_size: 2 * rows,
            })
            .expect("setup");
        let iterations = iterate(&mut solver, 2 * rows, 100_000);
        assert!(iterations > 0);

        // one lane per training row, not per dual variable
        let dev = solver.device();
        let half_lanes = dev.launch_for(rows).lanes() as u64;
        assert!(half_lanes < dev.launch_for(2 * rows).lanes() as u64);
        for operation in ["obj_diff", "update_gradient"] {
            let passes = dev.pass_count(operation);
            assert!(passes > 0);
            assert_eq!(dev.lane_count(operation), passes * half_lanes, "{operation}");
        }

        let (g, alpha, _) = fetch(&solver, 2 * rows);
        for t in 0..2 * rows {
            let mut expected = linear[t];
            for s in 0..2 * rows {
                let k = samples[s % rows].features.dot(&samples[t % rows].features);
                expected += alpha[s] * f64::from(y[s]) * f64::from(y[t]) * k;
            }
            assert_relative_eq!(g[t], expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_calls_before_setup_fail() {
        let samples = [point(1.0, 1.0), point(-1.0, -1.0)];
        let mut solver = solver(&samples, &SolverConfig::default());
        assert!(solver.select_working_set(2).is_err());
        assert!(solver.compute_alpha().is_err());
        assert!(solver.cache_stats().is_none());
    }

    #[test]
    fn test_setup_rejects_bad_input() {
        let samples = [point(1.0, 1.0), point(-1.0, -1.0)];
        let mut solver = solver(&samples, &SolverConfig::default());
        let init = SolverInit {
            y: &[1, 2],
            gradient: &[-1.0; 2],
            alpha: &[0.0; 2],
            alpha_status: &[AlphaStatus::LowerBound; 2],
            cp: 1.0,
            cn: 1.0,
            active_size: 2,
        };
        assert!(matches!(
            solver.setup_solver(init),
            Err(SVMError::InvalidLabel(_))
        ));
        assert!(matches!(
            solver.setup_solver(SolverInit {
                y: &[1, -1],
                active_size: 3,
                ..init
            }),
            Err(SVMError::DimensionMismatch { .. })
        ));
        assert!(solver
            .setup_solver(SolverInit {
                y: &[1, -1],
                cp: 0.0,
                ..init
            })
            .is_err());
    }

    #[test]
    fn test_selection_codes() {
        assert_eq!(Selection::Selected { i: 0, j: 1 }.code(), 0);
        assert_eq!(Selection::Converged.code(), 1);
    }
}
