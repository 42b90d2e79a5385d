use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra as na;
use rand::rngs::StdRng;
use rand::SeedableRng;

use molconf::dg::modeling::solitary_shape;
use molconf::dg::refinement::{refine, Constraints, RefinementConfig, SerialRefinement, Stage};
use molconf::dg::{DistanceMatrix, MetricMatrix, Partiality};
use molconf::shapes::{self, Shape};

fn shape_problem(shape: &Shape) -> (Constraints, na::Matrix4xX<f64>) {
    let mut rng = StdRng::seed_from_u64(1);
    let bounds = solitary_shape::shape_into_bounds(shape);
    let chirals = shape
        .tetrahedra
        .iter()
        .map(|&tetrahedron| solitary_shape::chiral_from_tetrahedron(tetrahedron, shape, 1.0))
        .collect();
    let constraints = Constraints::new(bounds.clone(), chirals, vec![]);

    let distances = DistanceMatrix::try_from_distance_bounds(bounds, Partiality::All, &mut rng)
        .expect("Idealized shape bounds metrize");
    let coordinates = MetricMatrix::from_distance_matrix(distances).embed();
    (constraints, coordinates)
}

fn gradient_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradient");

    for shape in [&*shapes::TETRAHEDRON, &*shapes::TRIGONAL_BIPYRAMID, &*shapes::OCTAHEDRON] {
        let (constraints, coordinates) = shape_problem(shape);
        let problem = SerialRefinement {
            constraints,
            stage: Stage::FixChirals,
        };
        let n = coordinates.len();
        let linear = coordinates.reshape_generic(na::Dyn(n), na::Const::<1>);

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", shape.name)),
            &linear,
            |b, linear| {
                b.iter(|| {
                    black_box(problem.error(linear));
                    black_box(problem.gradient(linear));
                })
            },
        );
    }

    group.finish();
}

fn staged_refinement(c: &mut Criterion) {
    let mut group = c.benchmark_group("refine");
    group.sample_size(20);

    for shape in [&*shapes::TETRAHEDRON, &*shapes::OCTAHEDRON] {
        let (constraints, coordinates) = shape_problem(shape);

        group.bench_function(BenchmarkId::from_parameter(format!("{:?}", shape.name)), |b| {
            b.iter(|| {
                refine(
                    constraints.clone(),
                    coordinates.clone(),
                    &RefinementConfig::default(),
                )
                .expect("Refinement of an idealized shape succeeds")
            })
        });
    }

    group.finish();
}

criterion_group!(benches, gradient_evaluation, staged_refinement);
criterion_main!(benches);
